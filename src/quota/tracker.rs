use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::AppResult;
use crate::models::AccountStatus;
use crate::store::Store;

#[derive(Debug, Clone, Copy, Default)]
pub struct AccountCounter {
    pub requests: i64,
    pub tokens: i64,
    pub last_request_at: i64,
}

// Best-effort in-memory usage counters with a write-through to the durable
// store. The in-memory view is strictly additive and may lag the database;
// the database accumulate path is a relative increment, so interleaving of
// the deferred writes cannot lose updates.
pub struct QuotaTracker {
    store: Arc<Store>,
    counters: DashMap<i64, AccountCounter>,
}

impl QuotaTracker {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            counters: DashMap::new(),
        }
    }

    pub fn record_usage(
        &self,
        account_id: i64,
        tokens: i64,
        requests: i64,
        status_code: u16,
        success: bool,
    ) {
        {
            let mut counter = self.counters.entry(account_id).or_default();
            counter.requests += requests;
            counter.tokens += tokens;
            counter.last_request_at = Utc::now().timestamp();
        }

        // Durable write happens off the caller's path.
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.accumulate_quota(account_id, tokens, requests) {
                tracing::warn!("Failed to accumulate quota for account {}: {}", account_id, e);
            }
            if let Err(e) =
                store.record_history(account_id, tokens, requests, None, status_code, success)
            {
                tracing::warn!("Failed to record history for account {}: {}", account_id, e);
            }
        });
    }

    pub fn usage(&self, account_id: i64) -> (i64, i64) {
        self.counters
            .get(&account_id)
            .map(|counter| (counter.tokens, counter.requests))
            .unwrap_or((0, 0))
    }

    // Cheap read against the store; saturated active accounts are flipped to
    // rate_limited as a side effect.
    pub fn check_rate_limit(&self, account_id: i64) -> AppResult<bool> {
        let account = self.store.get_account(account_id)?;
        if matches!(
            account.status,
            AccountStatus::RateLimited | AccountStatus::Cooldown
        ) {
            return Ok(true);
        }
        if account.quota_exhausted() {
            if account.status == AccountStatus::Active {
                self.store
                    .set_status(account_id, AccountStatus::RateLimited)?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    pub fn reset(&self, account_id: i64) -> AppResult<()> {
        self.counters.remove(&account_id);
        self.store.reset_quota(account_id)
    }
}
