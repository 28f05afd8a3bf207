mod agents;
mod api;
pub mod constants;
pub mod error;
mod logger;
mod models;
mod providers;
mod proxy;
mod quota;
mod store;
#[cfg(test)]
mod test_utils;
mod utils;

use std::sync::Arc;

use error::AppResult;
use store::Store;
use tracing::{error, info, warn};

fn api_port_from_env() -> u16 {
    if let Ok(port) = std::env::var("PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(parsed) if parsed > 0 => return parsed,
                _ => warn!("Ignoring invalid PORT value: {}", port),
            }
        }
    }
    constants::DEFAULT_API_PORT
}

// Seed accounts from well-known environment variables. Each provider gets at
// most one auto-detected row; operator-created accounts are left alone.
fn bootstrap_env_accounts(store: &Store) {
    let existing = store.list_accounts().unwrap_or_default();
    for candidate in providers::detect_env_accounts() {
        let already_present = existing
            .iter()
            .any(|account| account.provider == candidate.provider && account.auto_detected);
        if already_present {
            continue;
        }
        match store.create_account(candidate) {
            Ok(account) => info!(
                "Detected {} credentials in environment, created account {}",
                account.provider, account.id
            ),
            Err(e) => warn!("Failed to create detected account: {}", e),
        }
    }
}

async fn run_server() -> AppResult<()> {
    let data_dir = constants::data_dir();
    let store = Arc::new(Store::open(&data_dir)?);
    info!("Store opened at {:?}", store.db_path());

    bootstrap_env_accounts(&store);

    let config = store.proxy_config()?;
    let router = Arc::new(proxy::Router::new(store.clone(), config.routing_strategy));
    let tracker = Arc::new(quota::QuotaTracker::new(store.clone()));
    let engine = proxy::ProxyEngine::new(store.clone(), router.clone(), tracker.clone())?;

    if config.auto_start {
        match engine.start().await {
            Ok(()) => info!("Proxy auto-started on port {}", engine.port().await),
            Err(e) => warn!("Proxy auto-start failed: {}", e),
        }
    }

    let api_port = api_port_from_env();
    let state = api::ApiState {
        store,
        router,
        tracker,
        engine: engine.clone(),
    };
    let app = api::build_router(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", api_port)).await?;
    info!("Management API listening on http://127.0.0.1:{}", api_port);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            engine.stop().await;
        }
    }
    Ok(())
}

pub fn run() {
    logger::init_logger();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        if let Err(e) = run_server().await {
            error!("Startup failed: {}", e);
            std::process::exit(1);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::open_store;
    use crate::test_utils::ScopedEnvVar;

    #[test]
    fn api_port_prefers_valid_env_value() {
        let _guard = crate::test_utils::lock_env();
        let _port = ScopedEnvVar::set("PORT", "9310");
        assert_eq!(api_port_from_env(), 9310);
    }

    #[test]
    fn api_port_rejects_garbage() {
        let _guard = crate::test_utils::lock_env();
        let _port = ScopedEnvVar::set("PORT", "not-a-port");
        assert_eq!(api_port_from_env(), constants::DEFAULT_API_PORT);
    }

    #[test]
    fn env_bootstrap_creates_each_provider_once() {
        let (store, _dir) = open_store();
        let _guard = crate::test_utils::lock_env();
        let cleared: Vec<_> = providers::ENV_DETECTIONS
            .iter()
            .map(|&(var, _)| ScopedEnvVar::unset(var))
            .collect();
        let _key = ScopedEnvVar::set("OPENAI_API_KEY", "sk-env");

        bootstrap_env_accounts(&store);
        bootstrap_env_accounts(&store);

        let accounts = store.list_accounts().expect("list");
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].provider, "openai");
        assert!(accounts[0].auto_detected);
        assert_eq!(accounts[0].api_key, "sk-env");
        drop(cleared);
    }
}
