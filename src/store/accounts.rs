use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::Store;
use crate::error::{AppError, AppResult};
use crate::models::{Account, AccountStatus, AccountUpdate, NewAccount};
use crate::providers::RateLimitInfo;

const ACCOUNT_COLUMNS: &str = "id, provider, name, api_key, oauth_token, refresh_token, \
     token_expires_at, quota_limit, quota_used, quota_manual, quota_auto_detected, \
     rate_limit_requests, rate_limit_requests_remaining, rate_limit_requests_reset, \
     rate_limit_tokens, rate_limit_tokens_remaining, rate_limit_tokens_reset, \
     cooldown_until, last_rate_limit_at, status, auto_detected, model_access, \
     priority, last_used, created_at, updated_at";

impl Store {
    fn map_account(&self, row: &Row) -> rusqlite::Result<Account> {
        let status: String = row.get("status")?;
        let model_access: String = row.get("model_access")?;
        Ok(Account {
            id: row.get("id")?,
            provider: row.get("provider")?,
            name: row.get("name")?,
            api_key: self.key().decrypt(&row.get::<_, String>("api_key")?),
            oauth_token: self.key().decrypt(&row.get::<_, String>("oauth_token")?),
            refresh_token: self.key().decrypt(&row.get::<_, String>("refresh_token")?),
            token_expires_at: row.get("token_expires_at")?,
            quota_limit: row.get("quota_limit")?,
            quota_used: row.get("quota_used")?,
            quota_manual: row.get("quota_manual")?,
            quota_auto_detected: row.get("quota_auto_detected")?,
            rate_limit_requests: row.get("rate_limit_requests")?,
            rate_limit_requests_remaining: row.get("rate_limit_requests_remaining")?,
            rate_limit_requests_reset: row.get("rate_limit_requests_reset")?,
            rate_limit_tokens: row.get("rate_limit_tokens")?,
            rate_limit_tokens_remaining: row.get("rate_limit_tokens_remaining")?,
            rate_limit_tokens_reset: row.get("rate_limit_tokens_reset")?,
            cooldown_until: row.get("cooldown_until")?,
            last_rate_limit_at: row.get("last_rate_limit_at")?,
            status: AccountStatus::parse(&status),
            auto_detected: row.get("auto_detected")?,
            model_access: serde_json::from_str(&model_access).unwrap_or_default(),
            priority: row.get("priority")?,
            last_used: row.get("last_used")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn create_account(&self, new: NewAccount) -> AppResult<Account> {
        if crate::providers::get(&new.provider).is_none() {
            return Err(AppError::Account(format!(
                "unknown provider: {}",
                new.provider
            )));
        }
        let conn = self.conn()?;
        let now = Utc::now().timestamp();
        let model_access = serde_json::to_string(&new.model_access)
            .map_err(|e| AppError::Account(format!("invalid model_access: {}", e)))?;
        conn.execute(
            "INSERT INTO accounts (
                provider, name, api_key, oauth_token, refresh_token, token_expires_at,
                quota_limit, quota_manual, auto_detected, model_access, priority,
                status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'active', ?12, ?12)",
            params![
                new.provider,
                new.name,
                self.key().encrypt(&new.api_key)?,
                self.key().encrypt(&new.oauth_token)?,
                self.key().encrypt(&new.refresh_token)?,
                new.token_expires_at,
                new.quota_limit,
                new.quota_manual,
                new.auto_detected,
                model_access,
                new.priority,
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.get_account(id)
    }

    pub fn get_account(&self, id: i64) -> AppResult<Account> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM accounts WHERE id = ?1",
            ACCOUNT_COLUMNS
        ))?;
        stmt.query_row(params![id], |row| self.map_account(row))
            .optional()?
            .ok_or_else(|| AppError::Account(format!("account {} not found", id)))
    }

    pub fn list_accounts(&self) -> AppResult<Vec<Account>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM accounts ORDER BY id",
            ACCOUNT_COLUMNS
        ))?;
        let rows = stmt.query_map([], |row| self.map_account(row))?;
        let mut accounts = Vec::new();
        for account in rows {
            accounts.push(account?);
        }
        Ok(accounts)
    }

    // Accounts the router may consider: active, or in a cooldown that has
    // already elapsed. Stable id order so fill_first scans deterministically.
    pub fn list_routable(&self, exclude: Option<i64>) -> AppResult<Vec<Account>> {
        let conn = self.conn()?;
        let now = Utc::now().timestamp();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM accounts
             WHERE (status = 'active'
                    OR (status = 'cooldown' AND COALESCE(cooldown_until, 0) <= ?1))
               AND (?2 IS NULL OR id != ?2)
             ORDER BY id",
            ACCOUNT_COLUMNS
        ))?;
        let rows = stmt.query_map(params![now, exclude], |row| self.map_account(row))?;
        let mut accounts = Vec::new();
        for account in rows {
            accounts.push(account?);
        }
        Ok(accounts)
    }

    // Atomic partial update: only the fields present in the map are written,
    // so a caller changing the name cannot clobber a concurrent quota
    // increment or status transition happening on another connection.
    pub fn update_fields(&self, id: i64, update: AccountUpdate) -> AppResult<Account> {
        if let Some(provider) = &update.provider {
            if crate::providers::get(provider).is_none() {
                return Err(AppError::Account(format!("unknown provider: {}", provider)));
            }
        }

        let conn = self.conn()?;
        let now = Utc::now().timestamp();

        let mut query = "UPDATE accounts SET updated_at = ?1".to_string();
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now)];
        let mut param_idx = 2;

        if let Some(provider) = update.provider {
            query.push_str(&format!(", provider = ?{}", param_idx));
            params_vec.push(Box::new(provider));
            param_idx += 1;
        }
        if let Some(name) = update.name {
            query.push_str(&format!(", name = ?{}", param_idx));
            params_vec.push(Box::new(name));
            param_idx += 1;
        }
        if let Some(api_key) = update.api_key {
            query.push_str(&format!(", api_key = ?{}", param_idx));
            params_vec.push(Box::new(self.key().encrypt(&api_key)?));
            param_idx += 1;
        }
        if let Some(oauth_token) = update.oauth_token {
            query.push_str(&format!(", oauth_token = ?{}", param_idx));
            params_vec.push(Box::new(self.key().encrypt(&oauth_token)?));
            param_idx += 1;
        }
        if let Some(refresh_token) = update.refresh_token {
            query.push_str(&format!(", refresh_token = ?{}", param_idx));
            params_vec.push(Box::new(self.key().encrypt(&refresh_token)?));
            param_idx += 1;
        }
        if let Some(expires_at) = update.token_expires_at {
            query.push_str(&format!(", token_expires_at = ?{}", param_idx));
            params_vec.push(Box::new(expires_at));
            param_idx += 1;
        }
        if let Some(quota_limit) = update.quota_limit {
            query.push_str(&format!(", quota_limit = ?{}", param_idx));
            params_vec.push(Box::new(quota_limit));
            param_idx += 1;
        }
        if let Some(quota_used) = update.quota_used {
            query.push_str(&format!(", quota_used = ?{}", param_idx));
            params_vec.push(Box::new(quota_used));
            param_idx += 1;
        }
        if let Some(quota_manual) = update.quota_manual {
            query.push_str(&format!(", quota_manual = ?{}", param_idx));
            params_vec.push(Box::new(quota_manual));
            param_idx += 1;
        }
        if let Some(auto_detected) = update.quota_auto_detected {
            query.push_str(&format!(", quota_auto_detected = ?{}", param_idx));
            params_vec.push(Box::new(auto_detected));
            param_idx += 1;
        }
        if let Some(status) = update.status {
            query.push_str(&format!(", status = ?{}", param_idx));
            params_vec.push(Box::new(status.as_str().to_string()));
            param_idx += 1;
        }
        if let Some(model_access) = update.model_access {
            let encoded = serde_json::to_string(&model_access)
                .map_err(|e| AppError::Account(format!("invalid model_access: {}", e)))?;
            query.push_str(&format!(", model_access = ?{}", param_idx));
            params_vec.push(Box::new(encoded));
            param_idx += 1;
        }
        if let Some(priority) = update.priority {
            query.push_str(&format!(", priority = ?{}", param_idx));
            params_vec.push(Box::new(priority));
            param_idx += 1;
        }

        query.push_str(&format!(" WHERE id = ?{}", param_idx));
        params_vec.push(Box::new(id));
        let params_refs: Vec<&dyn rusqlite::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();

        let changed = conn.execute(&query, params_refs.as_slice())?;
        if changed == 0 {
            return Err(AppError::Account(format!("account {} not found", id)));
        }
        self.get_account(id)
    }

    pub fn delete_account(&self, id: i64) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;
        conn.execute(
            "DELETE FROM provider_health WHERE account_id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn set_status(&self, id: i64, status: AccountStatus) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE accounts SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().timestamp(), id],
        )?;
        Ok(())
    }

    pub fn set_cooldown(&self, id: i64, until: i64) -> AppResult<()> {
        let conn = self.conn()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "UPDATE accounts SET status = 'cooldown', cooldown_until = ?1,
                last_rate_limit_at = ?2, updated_at = ?2
             WHERE id = ?3",
            params![until, now, id],
        )?;
        Ok(())
    }

    // Usage accumulation is a relative increment at the storage layer so
    // concurrent requests compose; an application-level read-modify-write
    // here would lose updates.
    pub fn accumulate_quota(&self, id: i64, tokens: i64, _requests: i64) -> AppResult<()> {
        let conn = self.conn()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "UPDATE accounts SET quota_used = quota_used + ?1, last_used = ?2,
                updated_at = ?2
             WHERE id = ?3",
            params![tokens, now, id],
        )?;

        // Saturation check runs after the increment; only an active account
        // transitions, a cooldown stays a cooldown.
        conn.execute(
            "UPDATE accounts SET status = 'rate_limited', updated_at = ?1
             WHERE id = ?2 AND status = 'active'
               AND quota_limit > 0 AND quota_used >= quota_limit",
            params![now, id],
        )?;
        Ok(())
    }

    // Mirrors the latest rate-limit headers onto the account. The quota limit
    // is only auto-derived while the user has not pinned one manually.
    pub fn apply_rate_limits(&self, id: i64, limits: &RateLimitInfo) -> AppResult<()> {
        let account = self.get_account(id)?;
        let conn = self.conn()?;
        let now = Utc::now().timestamp();
        conn.execute(
            "UPDATE accounts SET
                rate_limit_requests = ?1,
                rate_limit_requests_remaining = ?2,
                rate_limit_requests_reset = ?3,
                rate_limit_tokens = ?4,
                rate_limit_tokens_remaining = ?5,
                rate_limit_tokens_reset = ?6,
                updated_at = ?7
             WHERE id = ?8",
            params![
                limits.requests_limit,
                limits.requests_remaining,
                limits.requests_reset,
                limits.tokens_limit,
                limits.tokens_remaining,
                limits.tokens_reset,
                now,
                id,
            ],
        )?;

        if !account.quota_manual && limits.tokens_limit > 0 {
            conn.execute(
                "UPDATE accounts SET quota_limit = ?1, quota_auto_detected = 1,
                    updated_at = ?2
                 WHERE id = ?3",
                params![limits.tokens_limit, now, id],
            )?;
            if limits.tokens_remaining >= 0 {
                conn.execute(
                    "UPDATE accounts SET quota_used = ?1, updated_at = ?2 WHERE id = ?3",
                    params![limits.tokens_limit - limits.tokens_remaining, now, id],
                )?;
            }
        }
        Ok(())
    }

    // Explicit admin reset: the only path that decreases quota_used.
    pub fn reset_quota(&self, id: i64) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE accounts SET quota_used = 0, status = 'active',
                cooldown_until = NULL, updated_at = ?1
             WHERE id = ?2",
            params![Utc::now().timestamp(), id],
        )?;
        Ok(())
    }
}
