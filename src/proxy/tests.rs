// End-to-end exercises for the proxy pipeline against throwaway local
// upstreams: failover, auth-failure classification, streaming preservation,
// and the shared-secret gate.

use axum::body::Body;
use axum::extract::Request;
use axum::response::IntoResponse;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::models::{AccountStatus, NewAccount, RoutingStrategy};
use crate::proxy::{ProxyEngine, Router};
use crate::quota::QuotaTracker;
use crate::store::test_support::open_store;
use crate::store::Store;

struct Harness {
    store: Arc<Store>,
    engine: Arc<ProxyEngine>,
    tracker: Arc<QuotaTracker>,
    _dir: tempfile::TempDir,
}

fn harness(strategy: RoutingStrategy) -> Harness {
    let (store, dir) = open_store();
    let router = Arc::new(Router::new(store.clone(), strategy));
    let tracker = Arc::new(QuotaTracker::new(store.clone()));
    let engine =
        ProxyEngine::new(store.clone(), router, tracker.clone()).expect("engine");
    Harness {
        store,
        engine,
        tracker,
        _dir: dir,
    }
}

fn seed_account(store: &Arc<Store>, provider: &str, name: &str) -> i64 {
    store
        .create_account(NewAccount {
            provider: provider.to_string(),
            name: name.to_string(),
            api_key: format!("sk-{}", name),
            ..NewAccount::default()
        })
        .expect("create account")
        .id
}

async fn start_upstream(app: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve upstream");
    });
    format!("http://{}", addr)
}

fn client_request(path: &str) -> Request {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(r#"{"model":"test"}"#))
        .expect("request")
}

async fn response_bytes(response: axum::response::Response) -> bytes::Bytes {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("collect body")
}

async fn wait_for<F: Fn() -> bool>(what: &str, predicate: F) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !predicate() {
        assert!(std::time::Instant::now() < deadline, "timed out waiting: {}", what);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failover_after_429_with_exhausted_token_window() {
    let h = harness(RoutingStrategy::RoundRobin);
    let a = seed_account(&h.store, "claude", "a");
    let b = seed_account(&h.store, "claude", "b");

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_app = hits.clone();
    let app = axum::Router::new().fallback(move || {
        let hits = hits_for_app.clone();
        async move {
            if hits.fetch_add(1, Ordering::SeqCst) == 0 {
                (
                    axum::http::StatusCode::TOO_MANY_REQUESTS,
                    [
                        ("anthropic-ratelimit-tokens-limit", "1000"),
                        ("anthropic-ratelimit-tokens-remaining", "0"),
                        (
                            "anthropic-ratelimit-tokens-reset",
                            "2030-01-01T00:00:00Z",
                        ),
                        ("content-type", "application/json"),
                    ],
                    r#"{"error":"rate limited"}"#,
                )
                    .into_response()
            } else {
                (
                    axum::http::StatusCode::OK,
                    [("content-type", "application/json")],
                    "{}",
                )
                    .into_response()
            }
        }
    });
    let origin = start_upstream(app).await;
    h.engine.set_origin_override(&origin);

    // Request 1 lands on A and trips the exhausted token window.
    let first = h.engine.serve(client_request("/v1/messages")).await;
    assert_eq!(first.status(), 429);

    let expected_reset = chrono::DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
        .unwrap()
        .timestamp();
    let store = h.store.clone();
    wait_for("account a cooldown", || {
        store.get_account(a).map(|acc| acc.status == AccountStatus::Cooldown).unwrap_or(false)
    })
    .await;
    let cooled = h.store.get_account(a).expect("get a");
    assert_eq!(cooled.cooldown_until, Some(expected_reset));

    // Request 2 routes around the cooled account.
    let second = h.engine.serve(client_request("/v1/messages")).await;
    assert_eq!(second.status(), 200);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert_eq!(
        h.store.get_account(b).expect("get b").status,
        AccountStatus::Active
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revoked_token_disables_account_immediately() {
    let h = harness(RoutingStrategy::RoundRobin);
    let a = seed_account(&h.store, "openai", "revoked");

    let app = axum::Router::new().fallback(|| async {
        (
            axum::http::StatusCode::UNAUTHORIZED,
            [("content-type", "application/json")],
            r#"{"error":{"code":"token_revoked"}}"#,
        )
    });
    let origin = start_upstream(app).await;
    h.engine.set_origin_override(&origin);

    let response = h.engine.serve(client_request("/v1/chat/completions")).await;
    assert_eq!(response.status(), 401);
    // The client still sees the upstream error body.
    let body = response_bytes(response).await;
    assert!(String::from_utf8_lossy(&body).contains("token_revoked"));

    assert_eq!(
        h.store.get_account(a).expect("get").status,
        AccountStatus::Disabled
    );
    let health = h.store.health(a).expect("health").expect("row");
    assert_eq!(
        health.consecutive_failures,
        crate::constants::PERMANENT_FAILURE_SENTINEL
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_auth_failures_disable_only_at_the_threshold() {
    let h = harness(RoutingStrategy::RoundRobin);
    let a = seed_account(&h.store, "openai", "flaky");

    let app = axum::Router::new().fallback(|| async {
        (
            axum::http::StatusCode::UNAUTHORIZED,
            [("content-type", "application/json")],
            r#"{"error":"clock skew, try again"}"#,
        )
    });
    let origin = start_upstream(app).await;
    h.engine.set_origin_override(&origin);

    for round in 1..=2 {
        let response = h.engine.serve(client_request("/v1/chat/completions")).await;
        assert_eq!(response.status(), 401);
        let account = h.store.get_account(a).expect("get");
        assert_ne!(
            account.status,
            AccountStatus::Disabled,
            "disabled too early, round {}",
            round
        );
    }

    let response = h.engine.serve(client_request("/v1/chat/completions")).await;
    assert_eq!(response.status(), 401);
    assert_eq!(
        h.store.get_account(a).expect("get").status,
        AccountStatus::Disabled
    );
    let health = h.store.health(a).expect("health").expect("row");
    assert_eq!(health.consecutive_failures, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_responses_pass_through_untouched() {
    let h = harness(RoutingStrategy::RoundRobin);
    let a = seed_account(&h.store, "openai", "stream");

    let sse = "data: {\"choices\":[]}\n\ndata: [DONE]\n\n";
    let app = axum::Router::new().fallback(move || async move {
        (
            axum::http::StatusCode::OK,
            [("content-type", "text/event-stream")],
            sse,
        )
    });
    let origin = start_upstream(app).await;
    h.engine.set_origin_override(&origin);

    let response = h.engine.serve(client_request("/v1/chat/completions")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    let body = response_bytes(response).await;
    assert_eq!(body.as_ref(), sse.as_bytes());

    // Header-only accounting for streams: zero tokens, one request.
    assert_eq!(h.tracker.usage(a), (0, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffered_json_body_is_parsed_and_relayed_byte_for_byte() {
    let h = harness(RoutingStrategy::RoundRobin);
    let a = seed_account(&h.store, "openai", "oneshot");

    let payload = r#"{"id":"cmpl-1","usage":{"total_tokens":1234}}"#;
    let app = axum::Router::new().fallback(move || async move {
        (
            axum::http::StatusCode::OK,
            [("content-type", "application/json")],
            payload,
        )
    });
    let origin = start_upstream(app).await;
    h.engine.set_origin_override(&origin);

    let response = h.engine.serve(client_request("/v1/chat/completions")).await;
    assert_eq!(response.status(), 200);
    let body = response_bytes(response).await;
    assert_eq!(body.as_ref(), payload.as_bytes());

    assert_eq!(h.tracker.usage(a), (1234, 1));
    let store = h.store.clone();
    wait_for("durable quota", || {
        store.get_account(a).map(|acc| acc.quota_used == 1234).unwrap_or(false)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shared_secret_gate_blocks_before_any_upstream_call() {
    let h = harness(RoutingStrategy::RoundRobin);
    seed_account(&h.store, "openai", "gated");

    let mut config = h.store.proxy_config().expect("config");
    config.api_key = "s".to_string();
    h.store.save_proxy_config(&config).expect("save config");

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_for_app = hits.clone();
    let app = axum::Router::new().fallback(move || {
        let hits = hits_for_app.clone();
        async move {
            hits.fetch_add(1, Ordering::SeqCst);
            (axum::http::StatusCode::OK, "{}")
        }
    });
    let origin = start_upstream(app).await;
    h.engine.set_origin_override(&origin);

    // Missing and wrong secrets are rejected without an upstream hit.
    let denied = h.engine.serve(client_request("/v1/chat/completions")).await;
    assert_eq!(denied.status(), 401);
    let wrong = h
        .engine
        .serve(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("authorization", "Bearer nope")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await;
    assert_eq!(wrong.status(), 401);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let allowed = h
        .engine
        .serve(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("authorization", "Bearer s")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await;
    assert_eq!(allowed.status(), 200);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_cooldown_account_serves_and_stays_active() {
    let h = harness(RoutingStrategy::RoundRobin);
    let a = seed_account(&h.store, "openai", "recovered");
    h.store
        .set_cooldown(a, Utc::now().timestamp() - 1)
        .expect("cooldown");

    let app = axum::Router::new().fallback(|| async {
        (
            axum::http::StatusCode::OK,
            [("content-type", "application/json")],
            "{}",
        )
    });
    let origin = start_upstream(app).await;
    h.engine.set_origin_override(&origin);

    let response = h.engine.serve(client_request("/v1/chat/completions")).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        h.store.get_account(a).expect("get").status,
        AccountStatus::Active
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn routing_exhaustion_surfaces_as_503() {
    let h = harness(RoutingStrategy::RoundRobin);
    let response = h.engine.serve(client_request("/v1/chat/completions")).await;
    assert_eq!(response.status(), 503);
    let body = response_bytes(response).await;
    assert!(String::from_utf8_lossy(&body).contains("no active accounts"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_upstream_is_a_502_not_an_auth_failure() {
    let h = harness(RoutingStrategy::RoundRobin);
    let a = seed_account(&h.store, "openai", "dark");
    h.engine.set_origin_override("http://127.0.0.1:9");

    let response = h.engine.serve(client_request("/v1/chat/completions")).await;
    assert_eq!(response.status(), 502);

    // No health ladder entry and no status change for a transport error.
    assert_eq!(
        h.store.get_account(a).expect("get").status,
        AccountStatus::Active
    );
    assert!(h.store.health(a).expect("health").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lifecycle_starts_on_ephemeral_port_and_stops_cleanly() {
    let h = harness(RoutingStrategy::RoundRobin);
    let mut config = h.store.proxy_config().expect("config");
    config.port = 0;
    h.store.save_proxy_config(&config).expect("save");

    h.engine.start().await.expect("start");
    assert!(h.engine.is_running().await);
    let port = h.engine.port().await;
    assert_ne!(port, 0);

    // Double start is refused while running.
    assert!(h.engine.start().await.is_err());

    // With no accounts, a live request drains through the listener as 503.
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://127.0.0.1:{}/v1/chat/completions", port))
        .body("{}")
        .send()
        .await
        .expect("request through listener");
    assert_eq!(response.status(), 503);

    h.engine.stop().await;
    assert!(!h.engine.is_running().await);

    // Restart works after a clean stop.
    h.engine.start().await.expect("restart");
    h.engine.stop().await;
}
