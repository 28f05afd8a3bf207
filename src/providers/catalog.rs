// Concrete adapters, one unit struct per provider. Anything not overridden
// here comes from the `ProviderAdapter` defaults (Bearer auth preferring the
// OAuth token, `/v1/models` validation, OpenAI-style usage parsing).

use reqwest::header::HeaderMap;
use reqwest::Url;
use std::path::PathBuf;

use super::{bearer, header_value, ProviderAdapter, RateLimitHeaders};
use crate::error::AppResult;
use crate::models::Account;

pub(super) fn all_adapters() -> Vec<Box<dyn ProviderAdapter>> {
    vec![
        Box::new(Claude),
        Box::new(OpenAi),
        Box::new(Gemini),
        Box::new(Antigravity),
        Box::new(Copilot),
        Box::new(Qwen),
        Box::new(Vertex),
        Box::new(IFlow),
        Box::new(Kiro),
        Box::new(Ampcode),
        Box::new(Zai),
        Box::new(Cursor),
    ]
}

fn home_join(segments: &[&str]) -> Option<PathBuf> {
    let mut path = dirs::home_dir()?;
    for segment in segments {
        path.push(segment);
    }
    Some(path)
}

fn home_paths(candidates: &[&[&str]]) -> Vec<PathBuf> {
    candidates.iter().filter_map(|p| home_join(p)).collect()
}

struct Claude;

impl ProviderAdapter for Claude {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn base_url(&self) -> &'static str {
        "https://api.anthropic.com"
    }

    fn validation_endpoint(&self) -> &'static str {
        "/v1/messages"
    }

    fn needs_oauth(&self) -> bool {
        true
    }

    fn authenticate(
        &self,
        headers: &mut HeaderMap,
        _url: &mut Url,
        account: &Account,
    ) -> AppResult<()> {
        // Claude Code sessions carry an OAuth token; raw API keys go in
        // x-api-key instead of Authorization.
        if !account.oauth_token.is_empty() {
            headers.insert("authorization", bearer(&account.oauth_token)?);
        } else if !account.api_key.is_empty() {
            headers.insert("x-api-key", header_value(&account.api_key)?);
        }
        headers.insert("anthropic-version", header_value("2023-06-01")?);
        Ok(())
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            requests_limit: "anthropic-ratelimit-requests-limit",
            requests_remaining: "anthropic-ratelimit-requests-remaining",
            requests_reset: "anthropic-ratelimit-requests-reset",
            tokens_limit: "anthropic-ratelimit-tokens-limit",
            tokens_remaining: "anthropic-ratelimit-tokens-remaining",
            tokens_reset: "anthropic-ratelimit-tokens-reset",
            input_tokens_limit: "anthropic-ratelimit-input-tokens-limit",
            input_tokens_remaining: "anthropic-ratelimit-input-tokens-remaining",
            output_tokens_limit: "anthropic-ratelimit-output-tokens-limit",
            output_tokens_remaining: "anthropic-ratelimit-output-tokens-remaining",
        }
    }

    fn parse_quota_from_body(&self, body: &[u8]) -> i64 {
        let Ok(data) = serde_json::from_slice::<serde_json::Value>(body) else {
            return 0;
        };
        let Some(usage) = data.get("usage") else {
            return 0;
        };
        let input = usage.get("input_tokens").and_then(|t| t.as_i64()).unwrap_or(0);
        let output = usage.get("output_tokens").and_then(|t| t.as_i64()).unwrap_or(0);
        input + output
    }

    fn credential_paths(&self) -> Vec<PathBuf> {
        home_paths(&[
            &[".claude", "credentials.json"],
            &[".config", "claude", "credentials.json"],
            &[".claude.json"],
        ])
    }
}

struct OpenAi;

impl ProviderAdapter for OpenAi {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn base_url(&self) -> &'static str {
        "https://api.openai.com"
    }

    fn needs_oauth(&self) -> bool {
        true
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            requests_limit: "x-ratelimit-limit-requests",
            requests_remaining: "x-ratelimit-remaining-requests",
            requests_reset: "x-ratelimit-reset-requests",
            tokens_limit: "x-ratelimit-limit-tokens",
            tokens_remaining: "x-ratelimit-remaining-tokens",
            tokens_reset: "x-ratelimit-reset-tokens",
            ..RateLimitHeaders::NONE
        }
    }

    fn credential_paths(&self) -> Vec<PathBuf> {
        home_paths(&[
            &[".openai", "credentials.json"],
            &[".config", "openai", "credentials.json"],
            &[".codex", "credentials.json"],
        ])
    }
}

struct Gemini;

impl ProviderAdapter for Gemini {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn base_url(&self) -> &'static str {
        "https://generativelanguage.googleapis.com"
    }

    fn validation_endpoint(&self) -> &'static str {
        "/v1beta/models"
    }

    fn needs_oauth(&self) -> bool {
        true
    }

    fn authenticate(
        &self,
        headers: &mut HeaderMap,
        url: &mut Url,
        account: &Account,
    ) -> AppResult<()> {
        if !account.oauth_token.is_empty() {
            headers.insert("authorization", bearer(&account.oauth_token)?);
        } else if !account.api_key.is_empty() {
            // Gemini takes raw API keys as a query parameter.
            url.query_pairs_mut().append_pair("key", &account.api_key);
        }
        Ok(())
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            requests_limit: "x-ratelimit-limit",
            requests_remaining: "x-ratelimit-remaining",
            requests_reset: "x-ratelimit-reset",
            ..RateLimitHeaders::NONE
        }
    }

    fn parse_quota_from_body(&self, body: &[u8]) -> i64 {
        let Ok(data) = serde_json::from_slice::<serde_json::Value>(body) else {
            return 0;
        };
        data.get("usageMetadata")
            .and_then(|u| u.get("totalTokenCount"))
            .and_then(|t| t.as_i64())
            .unwrap_or(0)
    }

    fn credential_paths(&self) -> Vec<PathBuf> {
        home_paths(&[
            &[".gemini", "credentials.json"],
            &[".config", "gemini", "credentials"],
            &[".gemini_cli", "credentials.json"],
        ])
    }
}

struct Antigravity;

impl ProviderAdapter for Antigravity {
    fn name(&self) -> &'static str {
        "antigravity"
    }

    // Antigravity rides Gemini's unified gateway to reach Claude models.
    fn base_url(&self) -> &'static str {
        "https://generativelanguage.googleapis.com"
    }

    fn validation_endpoint(&self) -> &'static str {
        "/v1beta/models"
    }

    fn needs_oauth(&self) -> bool {
        true
    }

    fn authenticate(
        &self,
        headers: &mut HeaderMap,
        url: &mut Url,
        account: &Account,
    ) -> AppResult<()> {
        if !account.oauth_token.is_empty() {
            headers.insert("authorization", bearer(&account.oauth_token)?);
        } else if !account.api_key.is_empty() {
            url.query_pairs_mut().append_pair("key", &account.api_key);
        }
        Ok(())
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            requests_limit: "x-ratelimit-limit-requests",
            requests_remaining: "x-ratelimit-remaining-requests",
            ..RateLimitHeaders::NONE
        }
    }

    fn credential_paths(&self) -> Vec<PathBuf> {
        home_paths(&[
            &[".antigravity", "credentials.json"],
            &[".config", "antigravity", "credentials.json"],
        ])
    }
}

struct Copilot;

impl ProviderAdapter for Copilot {
    fn name(&self) -> &'static str {
        "copilot"
    }

    fn base_url(&self) -> &'static str {
        "https://api.github.com"
    }

    fn validation_endpoint(&self) -> &'static str {
        "/user"
    }

    fn needs_oauth(&self) -> bool {
        true
    }

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
        headers.insert("accept", header_value("application/vnd.github+json")?);
        Ok(())
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            requests_limit: "x-ratelimit-limit",
            requests_remaining: "x-ratelimit-remaining",
            requests_reset: "x-ratelimit-reset",
            ..RateLimitHeaders::NONE
        }
    }

    fn credential_paths(&self) -> Vec<PathBuf> {
        home_paths(&[
            &[".config", "github-copilot", "hosts.json"],
            &[".github-copilot", "hosts.json"],
        ])
    }
}

struct Qwen;

impl ProviderAdapter for Qwen {
    fn name(&self) -> &'static str {
        "qwen"
    }

    fn base_url(&self) -> &'static str {
        "https://dashscope.aliyuncs.com"
    }

    fn validation_endpoint(&self) -> &'static str {
        "/compatible-mode/v1/models"
    }

    fn needs_oauth(&self) -> bool {
        true
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            requests_limit: "x-ratelimit-limit-requests",
            requests_remaining: "x-ratelimit-remaining-requests",
            tokens_limit: "x-ratelimit-limit-tokens",
            tokens_remaining: "x-ratelimit-remaining-tokens",
            ..RateLimitHeaders::NONE
        }
    }

    fn credential_paths(&self) -> Vec<PathBuf> {
        home_paths(&[
            &[".qwen", "credentials.json"],
            &[".config", "qwen", "credentials.json"],
        ])
    }
}

struct Vertex;

impl ProviderAdapter for Vertex {
    fn name(&self) -> &'static str {
        "vertex"
    }

    fn base_url(&self) -> &'static str {
        "https://aiplatform.googleapis.com"
    }

    fn needs_oauth(&self) -> bool {
        true
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            requests_limit: "x-ratelimit-limit",
            requests_remaining: "x-ratelimit-remaining",
            ..RateLimitHeaders::NONE
        }
    }

    fn credential_paths(&self) -> Vec<PathBuf> {
        home_paths(&[&[
            ".config",
            "gcloud",
            "application_default_credentials.json",
        ]])
    }
}

struct IFlow;

impl ProviderAdapter for IFlow {
    fn name(&self) -> &'static str {
        "iflow"
    }

    fn base_url(&self) -> &'static str {
        "https://api.iflow.ai"
    }

    fn needs_oauth(&self) -> bool {
        true
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            requests_limit: "x-ratelimit-limit-requests",
            requests_remaining: "x-ratelimit-remaining-requests",
            ..RateLimitHeaders::NONE
        }
    }

    fn credential_paths(&self) -> Vec<PathBuf> {
        home_paths(&[&[".iflow", "credentials.json"]])
    }
}

struct Kiro;

impl ProviderAdapter for Kiro {
    fn name(&self) -> &'static str {
        "kiro"
    }

    fn base_url(&self) -> &'static str {
        "https://api.kiro.ai"
    }

    fn needs_oauth(&self) -> bool {
        true
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            requests_limit: "x-ratelimit-limit",
            requests_remaining: "x-ratelimit-remaining",
            ..RateLimitHeaders::NONE
        }
    }

    fn credential_paths(&self) -> Vec<PathBuf> {
        home_paths(&[
            &[".kiro", "credentials.json"],
            &[".aws", "credentials"],
        ])
    }
}

struct Ampcode;

impl ProviderAdapter for Ampcode {
    fn name(&self) -> &'static str {
        "ampcode"
    }

    fn base_url(&self) -> &'static str {
        "https://ampcode.com"
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            requests_limit: "x-ratelimit-limit-requests",
            requests_remaining: "x-ratelimit-remaining-requests",
            requests_reset: "x-ratelimit-reset-requests",
            tokens_limit: "x-ratelimit-limit-tokens",
            tokens_remaining: "x-ratelimit-remaining-tokens",
            tokens_reset: "x-ratelimit-reset-tokens",
            ..RateLimitHeaders::NONE
        }
    }

    fn credential_paths(&self) -> Vec<PathBuf> {
        home_paths(&[
            &[".ampcode", "credentials.json"],
            &[".config", "ampcode", "credentials.json"],
        ])
    }
}

struct Zai;

impl ProviderAdapter for Zai {
    fn name(&self) -> &'static str {
        "z.ai"
    }

    fn base_url(&self) -> &'static str {
        "https://api.z.ai/api/paas/v4"
    }

    // /v4 already lives in the base URL.
    fn validation_endpoint(&self) -> &'static str {
        "/models"
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            requests_limit: "x-ratelimit-limit-requests",
            requests_remaining: "x-ratelimit-remaining-requests",
            requests_reset: "x-ratelimit-reset-requests",
            tokens_limit: "x-ratelimit-limit-tokens",
            tokens_remaining: "x-ratelimit-remaining-tokens",
            tokens_reset: "x-ratelimit-reset-tokens",
            ..RateLimitHeaders::NONE
        }
    }

    fn credential_paths(&self) -> Vec<PathBuf> {
        home_paths(&[
            &[".zai", "credentials.json"],
            &[".config", "zai", "credentials.json"],
        ])
    }
}

struct Cursor;

impl ProviderAdapter for Cursor {
    fn name(&self) -> &'static str {
        "cursor"
    }

    fn base_url(&self) -> &'static str {
        "https://api.cursor.sh"
    }

    fn authenticate(
        &self,
        headers: &mut HeaderMap,
        _url: &mut Url,
        account: &Account,
    ) -> AppResult<()> {
        if !account.api_key.is_empty() {
            headers.insert("authorization", bearer(&account.api_key)?);
        }
        Ok(())
    }

    fn rate_limit_headers(&self) -> RateLimitHeaders {
        RateLimitHeaders {
            requests_limit: "x-ratelimit-limit-requests",
            requests_remaining: "x-ratelimit-remaining-requests",
            requests_reset: "x-ratelimit-reset-requests",
            ..RateLimitHeaders::NONE
        }
    }
}
