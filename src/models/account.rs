use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    RateLimited,
    Cooldown,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::RateLimited => "rate_limited",
            AccountStatus::Cooldown => "cooldown",
            AccountStatus::Disabled => "disabled",
        }
    }

    // Unknown values fall back to active so a hand-edited row never bricks routing.
    pub fn parse(value: &str) -> Self {
        match value {
            "rate_limited" => AccountStatus::RateLimited,
            "cooldown" => AccountStatus::Cooldown,
            "disabled" => AccountStatus::Disabled,
            _ => AccountStatus::Active,
        }
    }
}

// One upstream credential usable as a routing target. Secret fields are
// plaintext in memory; the store encrypts them on write and decrypts on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub provider: String,
    pub name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub oauth_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub token_expires_at: Option<i64>,

    // Quota accounting. quota_limit of 0 means unknown/unlimited; quota_used
    // only ever decreases through an explicit reset.
    pub quota_limit: i64,
    pub quota_used: i64,
    #[serde(default)]
    pub quota_manual: bool,
    #[serde(default)]
    pub quota_auto_detected: bool,

    // Last-seen rate-limit headers, mirrored for decisions and display only.
    #[serde(default)]
    pub rate_limit_requests: i64,
    #[serde(default)]
    pub rate_limit_requests_remaining: i64,
    #[serde(default)]
    pub rate_limit_requests_reset: Option<i64>,
    #[serde(default)]
    pub rate_limit_tokens: i64,
    #[serde(default)]
    pub rate_limit_tokens_remaining: i64,
    #[serde(default)]
    pub rate_limit_tokens_reset: Option<i64>,

    #[serde(default)]
    pub cooldown_until: Option<i64>,
    #[serde(default)]
    pub last_rate_limit_at: Option<i64>,

    pub status: AccountStatus,
    #[serde(default)]
    pub auto_detected: bool,
    #[serde(default)]
    pub model_access: Vec<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub last_used: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Account {
    pub fn cooldown_expired(&self, now: i64) -> bool {
        self.status == AccountStatus::Cooldown
            && self.cooldown_until.map(|until| now >= until).unwrap_or(true)
    }

    pub fn quota_exhausted(&self) -> bool {
        self.quota_limit > 0 && self.quota_used >= self.quota_limit
    }

    // Strip secrets before a record leaves the core.
    pub fn sanitized(mut self) -> Self {
        self.api_key = String::new();
        self.oauth_token = String::new();
        self.refresh_token = String::new();
        self
    }
}

// Creation payload; the store assigns id and timestamps.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewAccount {
    pub provider: String,
    pub name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub oauth_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub token_expires_at: Option<i64>,
    #[serde(default)]
    pub quota_limit: i64,
    #[serde(default)]
    pub quota_manual: bool,
    #[serde(default)]
    pub auto_detected: bool,
    #[serde(default)]
    pub model_access: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

// Field map for partial account updates: only fields set to Some are
// written, so unrelated columns keep whatever concurrent writers put there.
#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub provider: Option<String>,
    pub name: Option<String>,
    pub api_key: Option<String>,
    pub oauth_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<Option<i64>>,
    pub quota_limit: Option<i64>,
    pub quota_used: Option<i64>,
    pub quota_manual: Option<bool>,
    pub quota_auto_detected: Option<bool>,
    pub status: Option<AccountStatus>,
    pub model_access: Option<Vec<String>>,
    pub priority: Option<i64>,
}

// Append-only usage log row.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaHistoryEntry {
    pub id: String,
    pub account_id: i64,
    pub requests_count: i64,
    pub tokens_used: i64,
    pub model: Option<String>,
    pub status_code: u16,
    pub success: bool,
    pub timestamp: i64,
}

// Health record per account, written by the validator and by auth-failure
// interception.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub account_id: i64,
    pub is_healthy: bool,
    pub response_time_ms: i64,
    pub last_checked: Option<i64>,
    pub consecutive_failures: i64,
}

#[cfg(test)]
pub(crate) fn test_account() -> Account {
    Account {
        id: 1,
        provider: "openai".into(),
        name: "test".into(),
        api_key: String::new(),
        oauth_token: String::new(),
        refresh_token: String::new(),
        token_expires_at: None,
        quota_limit: 0,
        quota_used: 0,
        quota_manual: false,
        quota_auto_detected: false,
        rate_limit_requests: 0,
        rate_limit_requests_remaining: 0,
        rate_limit_requests_reset: None,
        rate_limit_tokens: 0,
        rate_limit_tokens_remaining: 0,
        rate_limit_tokens_reset: None,
        cooldown_until: None,
        last_rate_limit_at: None,
        status: AccountStatus::Active,
        auto_detected: false,
        model_access: Vec::new(),
        priority: 0,
        last_used: None,
        created_at: 0,
        updated_at: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            AccountStatus::Active,
            AccountStatus::RateLimited,
            AccountStatus::Cooldown,
            AccountStatus::Disabled,
        ] {
            assert_eq!(AccountStatus::parse(status.as_str()), status);
        }
        assert_eq!(AccountStatus::parse("garbage"), AccountStatus::Active);
    }

    #[test]
    fn cooldown_expiry_checks_timestamp() {
        let mut account = test_account();
        account.status = AccountStatus::Cooldown;
        account.cooldown_until = Some(100);
        assert!(!account.cooldown_expired(99));
        assert!(account.cooldown_expired(100));

        account.status = AccountStatus::Active;
        assert!(!account.cooldown_expired(200));
    }

    #[test]
    fn sanitized_blanks_secrets() {
        let mut account = test_account();
        account.api_key = "sk-secret".into();
        account.oauth_token = "oauth".into();
        account.refresh_token = "refresh".into();
        let cleaned = account.sanitized();
        assert!(cleaned.api_key.is_empty());
        assert!(cleaned.oauth_token.is_empty());
        assert!(cleaned.refresh_token.is_empty());
    }
}
