mod account;
mod config;

pub use account::{
    Account, AccountStatus, AccountUpdate, NewAccount, ProviderHealth, QuotaHistoryEntry,
};
pub use config::{AgentConfig, ProxyConfig, RoutingStrategy};

#[cfg(test)]
pub(crate) use account::test_account;
