mod accounts;
mod health;
mod quota;
mod settings;

pub use quota::FailedRequest;

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppResult;
use crate::utils::crypto::MasterKey;

const DB_FILE_NAME: &str = "quotio.db";

// Durable authority for accounts, quota history, provider health, and the
// proxy/agent configuration rows. Everything else holds transient views and
// pushes mutations through here.
pub struct Store {
    db_path: PathBuf,
    key: MasterKey,
}

impl Store {
    pub fn open(data_dir: &Path) -> AppResult<Self> {
        fs::create_dir_all(data_dir)?;
        let key = MasterKey::load(data_dir)?;
        let store = Self {
            db_path: data_dir.join(DB_FILE_NAME),
            key,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn key(&self) -> &MasterKey {
        &self.key
    }

    // One connection per call keeps callers free of lock discipline; WAL plus
    // a busy timeout lets concurrent request tasks write without stepping on
    // each other.
    pub(crate) fn conn(&self) -> AppResult<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL;")?;
        Ok(conn)
    }

    fn init_schema(&self) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                api_key TEXT NOT NULL DEFAULT '',
                oauth_token TEXT NOT NULL DEFAULT '',
                refresh_token TEXT NOT NULL DEFAULT '',
                token_expires_at INTEGER,
                quota_limit INTEGER NOT NULL DEFAULT 0,
                quota_used INTEGER NOT NULL DEFAULT 0,
                quota_manual BOOLEAN NOT NULL DEFAULT 0,
                quota_auto_detected BOOLEAN NOT NULL DEFAULT 0,
                rate_limit_requests INTEGER NOT NULL DEFAULT 0,
                rate_limit_requests_remaining INTEGER NOT NULL DEFAULT 0,
                rate_limit_requests_reset INTEGER,
                rate_limit_tokens INTEGER NOT NULL DEFAULT 0,
                rate_limit_tokens_remaining INTEGER NOT NULL DEFAULT 0,
                rate_limit_tokens_reset INTEGER,
                cooldown_until INTEGER,
                last_rate_limit_at INTEGER,
                status TEXT NOT NULL DEFAULT 'active',
                auto_detected BOOLEAN NOT NULL DEFAULT 0,
                model_access TEXT NOT NULL DEFAULT '[]',
                priority INTEGER NOT NULL DEFAULT 0,
                last_used INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_accounts_provider ON accounts(provider);
            CREATE INDEX IF NOT EXISTS idx_accounts_status ON accounts(status);

            CREATE TABLE IF NOT EXISTS quota_history (
                id TEXT PRIMARY KEY,
                account_id INTEGER NOT NULL,
                requests_count INTEGER NOT NULL DEFAULT 0,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                model TEXT,
                status_code INTEGER NOT NULL DEFAULT 0,
                success BOOLEAN NOT NULL DEFAULT 1,
                timestamp INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_quota_history_account_id
                ON quota_history(account_id);
            CREATE INDEX IF NOT EXISTS idx_quota_history_timestamp
                ON quota_history(timestamp);

            CREATE TABLE IF NOT EXISTS provider_health (
                account_id INTEGER PRIMARY KEY,
                is_healthy BOOLEAN NOT NULL DEFAULT 1,
                response_time_ms INTEGER NOT NULL DEFAULT 0,
                last_checked INTEGER,
                consecutive_failures INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS proxy_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                port INTEGER NOT NULL DEFAULT 8081,
                routing_strategy TEXT NOT NULL DEFAULT 'round_robin',
                api_key TEXT NOT NULL DEFAULT '',
                auto_start BOOLEAN NOT NULL DEFAULT 0
            );
            INSERT OR IGNORE INTO proxy_config (id) VALUES (1);

            CREATE TABLE IF NOT EXISTS agent_config (
                agent_name TEXT PRIMARY KEY,
                config_path TEXT NOT NULL DEFAULT '',
                installed BOOLEAN NOT NULL DEFAULT 0,
                auto_configured BOOLEAN NOT NULL DEFAULT 0,
                proxy_url TEXT NOT NULL DEFAULT '',
                last_configured INTEGER
            );",
        )?;
        Ok(())
    }
}
