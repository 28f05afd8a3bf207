use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::Store;
use crate::constants::PERMANENT_FAILURE_SENTINEL;
use crate::error::AppResult;
use crate::models::ProviderHealth;

impl Store {
    pub fn health(&self, account_id: i64) -> AppResult<Option<ProviderHealth>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT account_id, is_healthy, response_time_ms, last_checked,
                    consecutive_failures
             FROM provider_health WHERE account_id = ?1",
            params![account_id],
            |row| {
                Ok(ProviderHealth {
                    account_id: row.get(0)?,
                    is_healthy: row.get(1)?,
                    response_time_ms: row.get(2)?,
                    last_checked: row.get(3)?,
                    consecutive_failures: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list_health(&self) -> AppResult<Vec<ProviderHealth>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT account_id, is_healthy, response_time_ms, last_checked,
                    consecutive_failures
             FROM provider_health ORDER BY account_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ProviderHealth {
                account_id: row.get(0)?,
                is_healthy: row.get(1)?,
                response_time_ms: row.get(2)?,
                last_checked: row.get(3)?,
                consecutive_failures: row.get(4)?,
            })
        })?;
        let mut records = Vec::new();
        for record in rows {
            records.push(record?);
        }
        Ok(records)
    }

    // Validator outcome write-back. A healthy probe clears the failure
    // ladder; an unhealthy one advances it.
    pub fn record_validation(
        &self,
        account_id: i64,
        is_healthy: bool,
        response_time_ms: i64,
    ) -> AppResult<()> {
        let conn = self.conn()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO provider_health (
                account_id, is_healthy, response_time_ms, last_checked,
                consecutive_failures
            ) VALUES (?1, ?2, ?3, ?4, CASE WHEN ?2 THEN 0 ELSE 1 END)
            ON CONFLICT(account_id) DO UPDATE SET
                is_healthy = ?2,
                response_time_ms = ?3,
                last_checked = ?4,
                consecutive_failures = CASE WHEN ?2 THEN 0
                    ELSE consecutive_failures + 1 END",
            params![account_id, is_healthy, response_time_ms, now],
        )?;
        Ok(())
    }

    // One transient auth failure. Returns the persisted count so the caller
    // can apply the disable threshold; per-row serialization in SQLite keeps
    // the count monotone under concurrent failures.
    pub fn increment_auth_failures(&self, account_id: i64) -> AppResult<i64> {
        let conn = self.conn()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO provider_health (
                account_id, is_healthy, last_checked, consecutive_failures
            ) VALUES (?1, 0, ?2, 1)
            ON CONFLICT(account_id) DO UPDATE SET
                is_healthy = 0,
                last_checked = ?2,
                consecutive_failures = consecutive_failures + 1",
            params![account_id, now],
        )?;
        conn.query_row(
            "SELECT consecutive_failures FROM provider_health WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    // Permanent credential failure: pin the sentinel so the ladder can never
    // be confused with a transient streak.
    pub fn mark_permanent_failure(&self, account_id: i64) -> AppResult<()> {
        let conn = self.conn()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO provider_health (
                account_id, is_healthy, last_checked, consecutive_failures
            ) VALUES (?1, 0, ?2, ?3)
            ON CONFLICT(account_id) DO UPDATE SET
                is_healthy = 0,
                last_checked = ?2,
                consecutive_failures = ?3",
            params![account_id, now, PERMANENT_FAILURE_SENTINEL],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewAccount;
    use crate::store::test_support::open_store;

    fn seeded_account(store: &Store) -> i64 {
        store
            .create_account(NewAccount {
                provider: "openai".to_string(),
                name: "health".to_string(),
                ..NewAccount::default()
            })
            .expect("create")
            .id
    }

    #[test]
    fn missing_health_row_reads_as_none() {
        let (store, _dir) = open_store();
        let id = seeded_account(&store);
        assert!(store.health(id).expect("health").is_none());
    }

    #[test]
    fn auth_failures_count_up_and_success_resets() {
        let (store, _dir) = open_store();
        let id = seeded_account(&store);

        assert_eq!(store.increment_auth_failures(id).unwrap(), 1);
        assert_eq!(store.increment_auth_failures(id).unwrap(), 2);
        assert_eq!(store.increment_auth_failures(id).unwrap(), 3);

        let health = store.health(id).expect("health").expect("row");
        assert!(!health.is_healthy);
        assert_eq!(health.consecutive_failures, 3);

        store.record_validation(id, true, 120).expect("validate");
        let health = store.health(id).expect("health").expect("row");
        assert!(health.is_healthy);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.response_time_ms, 120);
    }

    #[test]
    fn permanent_failure_pins_the_sentinel() {
        let (store, _dir) = open_store();
        let id = seeded_account(&store);

        store.mark_permanent_failure(id).expect("mark");
        let health = store.health(id).expect("health").expect("row");
        assert_eq!(health.consecutive_failures, PERMANENT_FAILURE_SENTINEL);
        assert!(!health.is_healthy);
    }
}
