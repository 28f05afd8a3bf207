use once_cell::sync::Lazy;
use std::path::PathBuf;

// Default listen ports; both can be overridden (management API via the PORT
// environment variable, proxy via the persisted proxy_config row).
pub const DEFAULT_API_PORT: u16 = 8080;
pub const DEFAULT_PROXY_PORT: u16 = 8081;

// Cooldown applied when a rate limit is detected without a usable reset header.
pub const DEFAULT_COOLDOWN_SECS: i64 = 15 * 60;

// Consecutive transient auth failures before an account is disabled.
pub const AUTH_FAILURE_THRESHOLD: i64 = 3;

// consecutive_failures value that marks an account as permanently failed.
pub const PERMANENT_FAILURE_SENTINEL: i64 = 100;

// Largest non-streaming body the interceptor will buffer for usage parsing.
pub const BODY_PEEK_LIMIT: u64 = 1024 * 1024;

pub const VALIDATION_TIMEOUT_SECS: u64 = 5;
pub const QUOTA_PROBE_TIMEOUT_SECS: u64 = 10;
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

pub static USER_AGENT: Lazy<String> = Lazy::new(|| {
    format!(
        "quotio/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});

// Data directory: QUOTIO_DATA_DIR override, otherwise ~/.quotio.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("QUOTIO_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".quotio")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_agent_carries_crate_version() {
        assert!(USER_AGENT.starts_with("quotio/"));
        assert!(USER_AGENT.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn data_dir_honors_env_override() {
        let _guard = crate::test_utils::lock_env();
        let _dir = crate::test_utils::ScopedEnvVar::set("QUOTIO_DATA_DIR", "/tmp/quotio-test");
        assert_eq!(data_dir(), PathBuf::from("/tmp/quotio-test"));
    }
}
