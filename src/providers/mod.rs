mod catalog;
pub mod oauth;
pub mod validation;

use once_cell::sync::Lazy;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Url;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{AppError, AppResult};
use crate::models::Account;

// Per-provider rate limit header vocabulary. Empty names mean the provider
// does not publish that signal.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitHeaders {
    pub requests_limit: &'static str,
    pub requests_remaining: &'static str,
    pub requests_reset: &'static str,
    pub tokens_limit: &'static str,
    pub tokens_remaining: &'static str,
    pub tokens_reset: &'static str,
    pub input_tokens_limit: &'static str,
    pub input_tokens_remaining: &'static str,
    pub output_tokens_limit: &'static str,
    pub output_tokens_remaining: &'static str,
}

impl RateLimitHeaders {
    pub const NONE: RateLimitHeaders = RateLimitHeaders {
        requests_limit: "",
        requests_remaining: "",
        requests_reset: "",
        tokens_limit: "",
        tokens_remaining: "",
        tokens_reset: "",
        input_tokens_limit: "",
        input_tokens_remaining: "",
        output_tokens_limit: "",
        output_tokens_remaining: "",
    };
}

// Last-seen rate limit signals extracted from one upstream response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimitInfo {
    pub requests_limit: i64,
    pub requests_remaining: i64,
    pub requests_reset: Option<i64>,
    pub tokens_limit: i64,
    pub tokens_remaining: i64,
    pub tokens_reset: Option<i64>,
    pub tokens_used: i64,
}

impl RateLimitInfo {
    // True when the headers say a window is fully consumed.
    pub fn exhausted(&self) -> bool {
        (self.tokens_limit > 0 && self.tokens_remaining == 0)
            || (self.requests_limit > 0 && self.requests_remaining == 0)
    }

    // Preferred cooldown end: tokens reset, then requests reset.
    pub fn reset_at(&self) -> Option<i64> {
        self.tokens_reset.or(self.requests_reset)
    }
}

// Capability set every provider adapter implements. Defaults cover the common
// OpenAI-compatible shape; adapters override only what differs.
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn base_url(&self) -> &'static str;

    fn validation_endpoint(&self) -> &'static str {
        "/v1/models"
    }

    fn needs_oauth(&self) -> bool {
        false
    }

    // Mutates the outgoing request in place. Runs while the URL still carries
    // the client's original path, before the origin rewrite.
    fn authenticate(
        &self,
        headers: &mut HeaderMap,
        _url: &mut Url,
        account: &Account,
    ) -> AppResult<()> {
        if !account.oauth_token.is_empty() {
            headers.insert("authorization", bearer(&account.oauth_token)?);
        } else if !account.api_key.is_empty() {
            headers.insert("authorization", bearer(&account.api_key)?);
        }
        Ok(())
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders::NONE
    }

    // Best-guess cumulative token usage from headers alone; most providers
    // expose nothing here.
    fn parse_quota_from_headers(&self, _headers: &HeaderMap) -> i64 {
        0
    }

    // Token usage from a buffered non-streaming JSON body.
    fn parse_quota_from_body(&self, body: &[u8]) -> i64 {
        let Ok(data) = serde_json::from_slice::<serde_json::Value>(body) else {
            return 0;
        };
        data.get("usage")
            .and_then(|u| u.get("total_tokens"))
            .and_then(|t| t.as_i64())
            .unwrap_or(0)
    }

    fn detect_rate_limit(&self, status: u16) -> bool {
        status == 429 || status == 403
    }

    // Credential files written by the provider's own CLI, best first.
    fn credential_paths(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    // Active quota probe: (used, limit); (0, 0) means unknown.
    fn fetch_quota(&self, _account: &Account) -> (i64, i64) {
        (0, 0)
    }
}

pub(crate) fn bearer(token: &str) -> AppResult<HeaderValue> {
    HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| AppError::Account(format!("credential is not header-safe: {}", e)))
}

pub(crate) fn header_value(value: &str) -> AppResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| AppError::Account(format!("credential is not header-safe: {}", e)))
}

static REGISTRY: Lazy<HashMap<&'static str, Box<dyn ProviderAdapter>>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, Box<dyn ProviderAdapter>> = HashMap::new();
    for adapter in catalog::all_adapters() {
        table.insert(adapter.name(), adapter);
    }
    table
});

pub fn get(name: &str) -> Option<&'static dyn ProviderAdapter> {
    REGISTRY.get(name).map(|adapter| adapter.as_ref())
}

pub fn names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = REGISTRY.keys().copied().collect();
    names.sort_unstable();
    names
}

// Environment variables that seed accounts at startup and via the detect
// endpoint.
pub const ENV_DETECTIONS: [(&str, &str); 7] = [
    ("OPENAI_API_KEY", "openai"),
    ("ANTHROPIC_API_KEY", "claude"),
    ("GOOGLE_API_KEY", "gemini"),
    ("GITHUB_TOKEN", "copilot"),
    ("QWEN_API_KEY", "qwen"),
    ("VERTEX_API_KEY", "vertex"),
    ("ANTIGRAVITY_API_KEY", "antigravity"),
];

pub fn detect_env_accounts() -> Vec<crate::models::NewAccount> {
    let mut detected = Vec::new();
    for (env_var, provider) in ENV_DETECTIONS {
        if let Ok(key) = std::env::var(env_var) {
            if !key.trim().is_empty() {
                detected.push(crate::models::NewAccount {
                    provider: provider.to_string(),
                    name: format!("{} (detected)", provider),
                    api_key: key,
                    auto_detected: true,
                    ..crate::models::NewAccount::default()
                });
            }
        }
    }
    detected
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    if name.is_empty() {
        return None;
    }
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<i64>().ok())
}

// Reset headers come as RFC 3339 instants or unix seconds depending on
// provider; both map to epoch seconds.
fn header_reset(headers: &HeaderMap, name: &str) -> Option<i64> {
    if name.is_empty() {
        return None;
    }
    let raw = headers.get(name)?.to_str().ok()?.trim();
    if let Ok(instant) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(instant.timestamp());
    }
    raw.parse::<i64>().ok()
}

// Reads every known rate-limit header for the adapter into a mirror record.
pub fn parse_rate_limits(adapter: &dyn ProviderAdapter, headers: &HeaderMap) -> RateLimitInfo {
    let vocabulary = adapter.rate_limit_headers();
    RateLimitInfo {
        requests_limit: header_i64(headers, vocabulary.requests_limit).unwrap_or(0),
        requests_remaining: header_i64(headers, vocabulary.requests_remaining).unwrap_or(0),
        requests_reset: header_reset(headers, vocabulary.requests_reset),
        tokens_limit: header_i64(headers, vocabulary.tokens_limit).unwrap_or(0),
        tokens_remaining: header_i64(headers, vocabulary.tokens_remaining).unwrap_or(0),
        tokens_reset: header_reset(headers, vocabulary.tokens_reset),
        tokens_used: adapter.parse_quota_from_headers(headers),
    }
}
