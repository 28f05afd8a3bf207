use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{AppError, AppResult};
use crate::models::{Account, AccountStatus, RoutingStrategy};
use crate::store::Store;

// Picks one eligible account per request. Eligible means active, or a
// cooldown whose window has elapsed; such records are healed back to active
// as a side effect of selection.
pub struct Router {
    store: Arc<Store>,
    strategy: RwLock<RoutingStrategy>,
    round_robin_index: AtomicU64,
}

impl Router {
    pub fn new(store: Arc<Store>, strategy: RoutingStrategy) -> Self {
        Self {
            store,
            strategy: RwLock::new(strategy),
            round_robin_index: AtomicU64::new(0),
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        *self.strategy.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_strategy(&self, strategy: RoutingStrategy) {
        *self
            .strategy
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = strategy;
        tracing::info!("Routing strategy set to {}", strategy.as_str());
    }

    pub fn select(&self) -> AppResult<Account> {
        self.select_excluding(None)
    }

    pub fn select_excluding(&self, exclude: Option<i64>) -> AppResult<Account> {
        let mut eligible = self.store.list_routable(exclude)?;

        // Heal cooldowns that have run out before considering them.
        let now = Utc::now().timestamp();
        for account in eligible.iter_mut() {
            if account.cooldown_expired(now) {
                self.store.set_status(account.id, AccountStatus::Active)?;
                account.status = AccountStatus::Active;
            }
        }

        if eligible.is_empty() {
            return Err(AppError::Routing("no active accounts available".to_string()));
        }

        match self.strategy() {
            RoutingStrategy::RoundRobin => self.select_round_robin(&eligible),
            RoutingStrategy::FillFirst => self.select_fill_first(&eligible),
        }
    }

    // Each call advances the counter exactly once, whether or not the caller
    // ends up keeping the account.
    fn select_round_robin(&self, eligible: &[Account]) -> AppResult<Account> {
        let index = self.round_robin_index.fetch_add(1, Ordering::Relaxed);
        Ok(eligible[(index % eligible.len() as u64) as usize].clone())
    }

    // First account with quota headroom wins; when every account is
    // saturated, degrade to the first active one rather than failing.
    fn select_fill_first(&self, eligible: &[Account]) -> AppResult<Account> {
        for account in eligible {
            if account.status != AccountStatus::Active {
                continue;
            }
            if account.quota_limit == 0 || account.quota_used < account.quota_limit {
                return Ok(account.clone());
            }
        }
        for account in eligible {
            if account.status == AccountStatus::Active {
                return Ok(account.clone());
            }
        }
        Ok(eligible[0].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewAccount;
    use crate::store::test_support::open_store;
    use std::collections::HashMap;

    fn seed(store: &Arc<Store>, name: &str) -> Account {
        store
            .create_account(NewAccount {
                provider: "openai".to_string(),
                name: name.to_string(),
                ..NewAccount::default()
            })
            .expect("create")
    }

    #[test]
    fn round_robin_visits_each_account_once_per_cycle() {
        let (store, _dir) = open_store();
        let a = seed(&store, "a");
        let b = seed(&store, "b");
        let c = seed(&store, "c");
        let router = Router::new(store, RoutingStrategy::RoundRobin);

        let mut counts: HashMap<i64, usize> = HashMap::new();
        for _ in 0..9 {
            let selected = router.select().expect("select");
            *counts.entry(selected.id).or_default() += 1;
        }
        assert_eq!(counts.get(&a.id), Some(&3));
        assert_eq!(counts.get(&b.id), Some(&3));
        assert_eq!(counts.get(&c.id), Some(&3));
    }

    #[test]
    fn disabled_accounts_are_never_selected() {
        let (store, _dir) = open_store();
        let only = seed(&store, "only");
        store
            .set_status(only.id, AccountStatus::Disabled)
            .expect("disable");
        let router = Router::new(store, RoutingStrategy::RoundRobin);

        let err = router.select().unwrap_err();
        assert!(err.to_string().contains("no active accounts"));
    }

    #[test]
    fn expired_cooldown_is_selected_and_healed_to_active() {
        let (store, _dir) = open_store();
        let account = seed(&store, "cooled");
        store
            .set_cooldown(account.id, Utc::now().timestamp() - 1)
            .expect("cooldown");
        let router = Router::new(store.clone(), RoutingStrategy::RoundRobin);

        let selected = router.select().expect("select");
        assert_eq!(selected.id, account.id);
        assert_eq!(selected.status, AccountStatus::Active);
        assert_eq!(
            store.get_account(account.id).expect("get").status,
            AccountStatus::Active
        );
    }

    #[test]
    fn running_cooldown_stays_out_of_rotation() {
        let (store, _dir) = open_store();
        let hot = seed(&store, "hot");
        let cooling = seed(&store, "cooling");
        store
            .set_cooldown(cooling.id, Utc::now().timestamp() + 600)
            .expect("cooldown");
        let router = Router::new(store, RoutingStrategy::RoundRobin);

        for _ in 0..4 {
            assert_eq!(router.select().expect("select").id, hot.id);
        }
    }

    fn set_quota(store: &Arc<Store>, id: i64, limit: i64, used: i64) {
        store
            .update_fields(
                id,
                crate::models::AccountUpdate {
                    quota_limit: Some(limit),
                    quota_used: Some(used),
                    ..crate::models::AccountUpdate::default()
                },
            )
            .expect("set quota");
    }

    #[test]
    fn fill_first_prefers_headroom() {
        let (store, _dir) = open_store();
        let a = seed(&store, "a");
        set_quota(&store, a.id, 100, 100);
        let b = seed(&store, "b");
        set_quota(&store, b.id, 100, 0);
        let router = Router::new(store, RoutingStrategy::FillFirst);

        assert_eq!(router.select().expect("select").id, b.id);
    }

    #[test]
    fn fill_first_degrades_to_first_active_when_all_saturated() {
        let (store, _dir) = open_store();
        let a = seed(&store, "a");
        set_quota(&store, a.id, 10, 10);
        let b = seed(&store, "b");
        set_quota(&store, b.id, 10, 10);
        let router = Router::new(store, RoutingStrategy::FillFirst);

        assert_eq!(router.select().expect("select").id, a.id);
    }

    #[test]
    fn fill_first_skips_rate_limited_accounts() {
        let (store, _dir) = open_store();
        let limited = seed(&store, "limited");
        store
            .set_status(limited.id, AccountStatus::RateLimited)
            .expect("limit");
        let fresh = seed(&store, "fresh");
        let router = Router::new(store, RoutingStrategy::FillFirst);

        assert_eq!(router.select().expect("select").id, fresh.id);
    }

    #[test]
    fn rate_limited_accounts_are_outside_the_eligibility_scan() {
        // The scan only admits active and expired-cooldown records. An
        // account that turns rate_limited after selection is re-judged by the
        // engine, where round_robin tolerates it and fill_first does not.
        let (store, _dir) = open_store();
        let limited = seed(&store, "limited");
        store
            .set_status(limited.id, AccountStatus::RateLimited)
            .expect("limit");
        let router = Router::new(store, RoutingStrategy::RoundRobin);

        assert!(router.select().is_err());
    }

    #[test]
    fn exclusion_removes_an_account_from_one_selection() {
        let (store, _dir) = open_store();
        let a = seed(&store, "a");
        let b = seed(&store, "b");
        let router = Router::new(store, RoutingStrategy::RoundRobin);

        for _ in 0..4 {
            let selected = router.select_excluding(Some(a.id)).expect("select");
            assert_eq!(selected.id, b.id);
        }
    }
}
