// Response-stage observation: token accounting, rate-limit mirroring,
// cooldown enforcement, and auth-failure classification. Everything here is
// best-effort; a bookkeeping failure must never corrupt the bytes relayed to
// the client.

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use chrono::Utc;
use reqwest::header::HeaderMap;
use std::sync::Arc;

use crate::constants::{
    AUTH_FAILURE_THRESHOLD, BODY_PEEK_LIMIT, DEFAULT_COOLDOWN_SECS,
};
use crate::models::AccountStatus;
use crate::providers;
use crate::quota::QuotaTracker;
use crate::store::Store;

// Error codes that mean the credential itself is dead and will not recover
// without human action.
const PERMANENT_AUTH_MARKERS: [&str; 7] = [
    "invalid_api_key",
    "invalid_client_id",
    "invalid_grant",
    "access_denied",
    "token_revoked",
    "unauthorized_client",
    "unsupported_grant_type",
];

const STREAMING_CONTENT_TYPES: [&str; 3] =
    ["text/event-stream", "text/plain", "application/octet-stream"];

// A streaming response must never be consumed here; misclassifying one would
// stall the client, so when in doubt this leans toward streaming.
pub(crate) fn is_streaming(headers: &HeaderMap) -> bool {
    if let Some(content_type) = headers.get("content-type").and_then(|v| v.to_str().ok()) {
        if STREAMING_CONTENT_TYPES
            .iter()
            .any(|streaming| content_type.contains(streaming))
        {
            return true;
        }
    }
    headers
        .get("transfer-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|te| te.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

pub(crate) fn contains_permanent_marker(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body).to_lowercase();
    PERMANENT_AUTH_MARKERS
        .iter()
        .any(|marker| text.contains(marker))
}

fn is_end_to_end_header(name: &str) -> bool {
    !matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

fn relay_headers(builder: axum::http::response::Builder, headers: &HeaderMap) -> axum::http::response::Builder {
    let mut builder = builder;
    for (name, value) in headers.iter() {
        if is_end_to_end_header(name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    builder
}

fn build_response(status: u16, headers: &HeaderMap, body: Body) -> Response {
    relay_headers(Response::builder().status(status), headers)
        .body(body)
        .unwrap_or_else(|e| {
            tracing::error!("Failed to assemble relay response: {}", e);
            Response::builder()
                .status(502)
                .body(Body::empty())
                .expect("static response")
        })
}

pub(crate) async fn observe_response(
    store: &Arc<Store>,
    tracker: &QuotaTracker,
    account_id: i64,
    upstream: reqwest::Response,
) -> Response {
    let mut upstream = Some(upstream);
    let status = upstream.as_ref().unwrap().status().as_u16();
    let headers = upstream.as_ref().unwrap().headers().clone();
    let success = (200..300).contains(&status);

    // The account may have moved since selection; bookkeeping runs against
    // its current state.
    let account = match store.get_account(account_id) {
        Ok(account) => account,
        Err(e) => {
            tracing::warn!("Account {} vanished mid-request: {}", account_id, e);
            return relay_unobserved(status, headers, upstream.take().unwrap()).await;
        }
    };
    let Some(adapter) = providers::get(&account.provider) else {
        tracing::warn!("Provider {} missing for account {}", account.provider, account_id);
        return relay_unobserved(status, headers, upstream.take().unwrap()).await;
    };

    let streaming = is_streaming(&headers);
    let content_length = upstream.as_ref().unwrap().content_length().unwrap_or(0);
    let has_content_type = headers.contains_key("content-type");
    let auth_failure = status == 401 || status == 403;

    // One-shot peek: bounded, non-streaming JSON bodies only. Auth failures
    // are buffered too so the permanent-marker scan can read them; either
    // way the client receives the exact upstream bytes.
    let wants_peek =
        !streaming && has_content_type && content_length > 0 && content_length < BODY_PEEK_LIMIT;
    let buffered: Option<Bytes> = if wants_peek || (auth_failure && !streaming) {
        match upstream.take().unwrap().bytes().await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!("Failed reading upstream body for account {}: {}", account_id, e);
                return build_response(502, &HeaderMap::new(), Body::empty());
            }
        }
    } else {
        None
    };

    let mut tokens_used = 0i64;
    if wants_peek {
        if let Some(bytes) = &buffered {
            tokens_used = adapter.parse_quota_from_body(bytes);
        }
    }
    if tokens_used == 0 {
        tokens_used = adapter.parse_quota_from_headers(&headers);
    }

    // Mirror every known rate-limit header, then honor an exhausted window.
    let limits = providers::parse_rate_limits(adapter, &headers);
    if let Err(e) = store.apply_rate_limits(account_id, &limits) {
        tracing::warn!("Failed to mirror rate limits for account {}: {}", account_id, e);
    }
    if limits.exhausted() {
        let until = limits
            .reset_at()
            .unwrap_or_else(|| Utc::now().timestamp() + DEFAULT_COOLDOWN_SECS);
        tracing::info!(
            "Rate limit exhausted (headers) for account {} - entering cooldown",
            account_id
        );
        if let Err(e) = store.set_cooldown(account_id, until) {
            tracing::warn!("Failed to set cooldown for account {}: {}", account_id, e);
        }
    }

    tracker.record_usage(account_id, tokens_used, 1, status, success);

    if auth_failure {
        handle_auth_failure(store, account_id, buffered.as_deref());
    }

    if status == 429 || adapter.detect_rate_limit(status) {
        tracing::info!("Rate limit detected (status {}) for account {}", status, account_id);
        match store.get_account(account_id) {
            Ok(current) if current.status != AccountStatus::Cooldown => {
                let until = Utc::now().timestamp() + DEFAULT_COOLDOWN_SECS;
                if let Err(e) = store.set_cooldown(account_id, until) {
                    tracing::warn!("Failed to set cooldown for account {}: {}", account_id, e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Failed to reload account {}: {}", account_id, e);
            }
        }
    }

    match buffered {
        Some(bytes) => build_response(status, &headers, Body::from(bytes)),
        None => build_response(
            status,
            &headers,
            Body::from_stream(upstream.take().unwrap().bytes_stream()),
        ),
    }
}

// Relay with no bookkeeping, used when the account or adapter cannot be
// resolved anymore.
async fn relay_unobserved(status: u16, headers: HeaderMap, upstream: reqwest::Response) -> Response {
    build_response(status, &headers, Body::from_stream(upstream.bytes_stream()))
}

// One 401/403 is not disabling by itself. Permanent-marker bodies disable
// immediately; transient failures climb a ladder and disable at the
// threshold.
fn handle_auth_failure(store: &Arc<Store>, account_id: i64, body: Option<&[u8]>) {
    if let Some(body) = body {
        if contains_permanent_marker(body) {
            tracing::warn!(
                "Permanent auth failure for account {} - marking disabled",
                account_id
            );
            if let Err(e) = store.set_status(account_id, AccountStatus::Disabled) {
                tracing::warn!("Failed to disable account {}: {}", account_id, e);
            }
            if let Err(e) = store.mark_permanent_failure(account_id) {
                tracing::warn!("Failed to mark permanent failure for {}: {}", account_id, e);
            }
            return;
        }
    }

    match store.increment_auth_failures(account_id) {
        Ok(failures) if failures >= AUTH_FAILURE_THRESHOLD => {
            tracing::warn!(
                "Auth failure threshold reached for account {} ({} consecutive) - marking disabled",
                account_id,
                failures
            );
            if let Err(e) = store.set_status(account_id, AccountStatus::Disabled) {
                tracing::warn!("Failed to disable account {}: {}", account_id, e);
            }
        }
        Ok(failures) => {
            tracing::warn!(
                "Auth failure for account {} - warning state ({}/{})",
                account_id,
                failures,
                AUTH_FAILURE_THRESHOLD
            );
        }
        Err(e) => {
            tracing::warn!("Failed to count auth failure for account {}: {}", account_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                reqwest::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        headers
    }

    #[test]
    fn streaming_detection_covers_content_types_and_chunked() {
        assert!(is_streaming(&headers_with(&[(
            "content-type",
            "text/event-stream; charset=utf-8"
        )])));
        assert!(is_streaming(&headers_with(&[("content-type", "text/plain")])));
        assert!(is_streaming(&headers_with(&[(
            "content-type",
            "application/octet-stream"
        )])));
        assert!(is_streaming(&headers_with(&[(
            "transfer-encoding",
            "Chunked"
        )])));
        assert!(!is_streaming(&headers_with(&[(
            "content-type",
            "application/json"
        )])));
        assert!(!is_streaming(&HeaderMap::new()));
    }

    #[test]
    fn permanent_markers_match_case_insensitively() {
        assert!(contains_permanent_marker(
            br#"{"error":{"code":"token_revoked"}}"#
        ));
        assert!(contains_permanent_marker(
            br#"{"error":"Invalid_Grant detected"}"#
        ));
        assert!(contains_permanent_marker(b"plain invalid_api_key text"));
        assert!(!contains_permanent_marker(
            br#"{"error":"temporarily unavailable"}"#
        ));
    }

    #[test]
    fn hop_by_hop_headers_are_not_relayed() {
        assert!(!is_end_to_end_header("transfer-encoding"));
        assert!(!is_end_to_end_header("connection"));
        assert!(!is_end_to_end_header("content-length"));
        assert!(is_end_to_end_header("content-type"));
        assert!(is_end_to_end_header("anthropic-ratelimit-tokens-limit"));
    }
}
