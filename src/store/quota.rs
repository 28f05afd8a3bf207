use chrono::Utc;
use rusqlite::params;
use std::collections::HashMap;
use uuid::Uuid;

use super::Store;
use crate::error::AppResult;
use crate::models::QuotaHistoryEntry;

// Joined view used by the failed-requests endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FailedRequest {
    pub id: String,
    pub account_id: i64,
    pub provider: String,
    pub account_name: String,
    pub model: Option<String>,
    pub status_code: u16,
    pub tokens_used: i64,
    pub timestamp: i64,
}

impl Store {
    // Append-only: history rows are never updated or rewritten.
    pub fn record_history(
        &self,
        account_id: i64,
        tokens_used: i64,
        requests_count: i64,
        model: Option<&str>,
        status_code: u16,
        success: bool,
    ) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO quota_history (
                id, account_id, requests_count, tokens_used, model, status_code,
                success, timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                Uuid::new_v4().to_string(),
                account_id,
                requests_count,
                tokens_used,
                model,
                status_code,
                success,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    pub fn quota_history(&self, account_id: i64, limit: usize) -> AppResult<Vec<QuotaHistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, account_id, requests_count, tokens_used, model, status_code,
                    success, timestamp
             FROM quota_history
             WHERE account_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![account_id, limit as i64], |row| {
            Ok(QuotaHistoryEntry {
                id: row.get("id")?,
                account_id: row.get("account_id")?,
                requests_count: row.get("requests_count")?,
                tokens_used: row.get("tokens_used")?,
                model: row.get("model")?,
                status_code: row.get("status_code")?,
                success: row.get("success")?,
                timestamp: row.get("timestamp")?,
            })
        })?;
        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry?);
        }
        Ok(entries)
    }

    pub fn failed_requests(&self, limit: usize) -> AppResult<Vec<FailedRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT quota_history.id, quota_history.account_id, accounts.provider,
                    accounts.name, quota_history.model, quota_history.status_code,
                    quota_history.tokens_used, quota_history.timestamp
             FROM quota_history
             JOIN accounts ON quota_history.account_id = accounts.id
             WHERE quota_history.success = 0
             ORDER BY quota_history.timestamp DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(FailedRequest {
                id: row.get(0)?,
                account_id: row.get(1)?,
                provider: row.get(2)?,
                account_name: row.get(3)?,
                model: row.get(4)?,
                status_code: row.get(5)?,
                tokens_used: row.get(6)?,
                timestamp: row.get(7)?,
            })
        })?;
        let mut entries = Vec::new();
        for entry in rows {
            entries.push(entry?);
        }
        Ok(entries)
    }

    // Cumulative token usage grouped by model for one account.
    pub fn model_usage(&self, account_id: i64) -> AppResult<HashMap<String, i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT COALESCE(model, ''), SUM(tokens_used)
             FROM quota_history
             WHERE account_id = ?1
             GROUP BY model",
        )?;
        let rows = stmt.query_map(params![account_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut usage = HashMap::new();
        for row in rows {
            let (model, tokens) = row?;
            usage.insert(model, tokens);
        }
        Ok(usage)
    }

    // (requests, tokens, successes) since local midnight, for the dashboard.
    pub fn usage_today(&self) -> AppResult<(i64, i64, i64)> {
        let start_of_day = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc().timestamp())
            .unwrap_or(0);
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(tokens_used), 0),
                    COALESCE(SUM(CASE WHEN success THEN 1 ELSE 0 END), 0)
             FROM quota_history
             WHERE timestamp >= ?1",
            params![start_of_day],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(Into::into)
    }
}
