use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use reqwest::header::HeaderMap;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info, warn};

use super::intercept;
use crate::constants::SHUTDOWN_GRACE_SECS;
use crate::error::{AppError, AppResult};
use crate::models::{Account, AccountStatus, RoutingStrategy};
use crate::providers;
use crate::quota::QuotaTracker;
use crate::store::Store;

struct Lifecycle {
    running: bool,
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

// The reverse proxy proper: one listener, a per-request director that picks
// and authenticates an account, and a response interceptor that keeps the
// quota state machine honest.
pub struct ProxyEngine {
    store: Arc<Store>,
    router: Arc<super::Router>,
    tracker: Arc<QuotaTracker>,
    client: reqwest::Client,
    lifecycle: Mutex<Lifecycle>,
    #[cfg(test)]
    origin_override: std::sync::RwLock<Option<reqwest::Url>>,
}

impl ProxyEngine {
    pub fn new(
        store: Arc<Store>,
        router: Arc<super::Router>,
        tracker: Arc<QuotaTracker>,
    ) -> AppResult<Arc<Self>> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Arc::new(Self {
            store,
            router,
            tracker,
            client,
            lifecycle: Mutex::new(Lifecycle {
                running: false,
                port: 0,
                shutdown: None,
                handle: None,
            }),
            #[cfg(test)]
            origin_override: std::sync::RwLock::new(None),
        }))
    }

    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            return Err(AppError::Config("proxy server already running".to_string()));
        }

        let config = self.store.proxy_config()?;
        self.router.set_strategy(config.routing_strategy);

        let listener =
            tokio::net::TcpListener::bind(("127.0.0.1", config.port)).await?;
        let port = listener.local_addr()?.port();

        let app = axum::Router::new()
            .fallback(handle_proxy)
            .with_state(self.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = serve.await {
                error!("Proxy server error: {}", e);
            }
        });

        lifecycle.running = true;
        lifecycle.port = port;
        lifecycle.shutdown = Some(shutdown_tx);
        lifecycle.handle = Some(handle);
        info!("Proxy server started on port {}", port);
        Ok(())
    }

    // Signals shutdown, lets in-flight requests drain for the grace window,
    // then tears the listener down.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.running {
            return;
        }
        if let Some(shutdown) = lifecycle.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut handle) = lifecycle.handle.take() {
            if tokio::time::timeout(Duration::from_secs(SHUTDOWN_GRACE_SECS), &mut handle)
                .await
                .is_err()
            {
                warn!("Graceful drain window elapsed, aborting proxy listener");
                handle.abort();
            }
        }
        lifecycle.running = false;
        info!("Proxy server stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.running
    }

    pub async fn port(&self) -> u16 {
        let lifecycle = self.lifecycle.lock().await;
        if lifecycle.running {
            lifecycle.port
        } else {
            self.store
                .proxy_config()
                .map(|config| config.port)
                .unwrap_or(crate::constants::DEFAULT_PROXY_PORT)
        }
    }

    // Routing validity: disabled never routes; an elapsed cooldown heals to
    // active; rate_limited only routes under round_robin.
    fn is_valid_for_routing(&self, account: &Account) -> bool {
        match account.status {
            AccountStatus::Disabled => false,
            AccountStatus::Cooldown => {
                let now = Utc::now().timestamp();
                if account.cooldown_expired(now) {
                    if let Err(e) = self.store.set_status(account.id, AccountStatus::Active) {
                        warn!("Failed to reactivate account {}: {}", account.id, e);
                    }
                    true
                } else {
                    false
                }
            }
            AccountStatus::RateLimited => {
                self.router.strategy() != RoutingStrategy::FillFirst
            }
            AccountStatus::Active => true,
        }
    }

    pub(crate) async fn serve(self: &Arc<Self>, req: Request) -> Response {
        // Optional shared-secret gate; nothing goes upstream on a miss.
        match self.store.proxy_config() {
            Ok(config) if !config.api_key.is_empty() => {
                let presented = req
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "));
                let authorized = presented
                    .map(|candidate| constant_time_str_eq(candidate, &config.api_key))
                    .unwrap_or(false);
                if !authorized {
                    return error_response(401, "Unauthorized");
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("Failed to read proxy config: {}", e);
                return error_response(500, "proxy configuration unavailable");
            }
        }

        // Select, and re-judge once with the first pick excluded. The
        // round-robin counter is deliberately not rewound on a rejected pick.
        let account = match self.router.select() {
            Ok(account) => account,
            Err(e) => {
                warn!("Account selection failed: {}", e);
                return error_response(503, "no active accounts available");
            }
        };
        let account = if self.is_valid_for_routing(&account) {
            account
        } else {
            info!(
                "Account {} not valid for routing (status: {})",
                account.id,
                account.status.as_str()
            );
            match self.router.select_excluding(Some(account.id)) {
                Ok(next) => next,
                Err(e) => {
                    warn!("No valid accounts available: {}", e);
                    return error_response(503, "no active accounts available");
                }
            }
        };

        let Some(adapter) = providers::get(&account.provider) else {
            error!("Provider not found: {}", account.provider);
            return error_response(502, "provider not found");
        };

        // The URL keeps the client's path and query while authenticate runs;
        // only scheme/host/port come from the adapter's origin.
        let mut url = match reqwest::Url::parse(adapter.base_url()) {
            Ok(url) => url,
            Err(e) => {
                error!("Invalid base URL for {}: {}", account.provider, e);
                return error_response(502, "provider origin misconfigured");
            }
        };
        url.set_path(req.uri().path());
        url.set_query(req.uri().query());

        #[cfg(test)]
        if let Some(origin) = self
            .origin_override
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
        {
            let _ = url.set_scheme(origin.scheme());
            let _ = url.set_host(origin.host_str());
            let _ = url.set_port(origin.port());
        }

        let mut headers = HeaderMap::new();
        for (name, value) in req.headers() {
            if is_forwardable_header(name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }
        if let Err(e) = adapter.authenticate(&mut headers, &mut url, &account) {
            error!("Error authenticating request: {}", e);
            return error_response(502, "failed to authenticate upstream request");
        }

        let method = req.method().clone();
        // A bodiless GET/HEAD must not grow a chunked body on the way out.
        let bodiless = matches!(method.as_str(), "GET" | "HEAD")
            && req.headers().get("content-length").is_none()
            && req.headers().get("transfer-encoding").is_none();
        let mut outgoing = self.client.request(method, url).headers(headers);
        if !bodiless {
            outgoing =
                outgoing.body(reqwest::Body::wrap_stream(req.into_body().into_data_stream()));
        }
        let upstream = match outgoing.send().await {
            Ok(response) => response,
            Err(e) => {
                // Transport failure: surfaced as a gateway error, never
                // counted against the account's credentials.
                warn!("Upstream request failed for account {}: {}", account.id, e);
                return error_response(502, "upstream request failed");
            }
        };

        intercept::observe_response(&self.store, &self.tracker, account.id, upstream).await
    }

    #[cfg(test)]
    pub(crate) fn set_origin_override(&self, origin: &str) {
        *self
            .origin_override
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some(reqwest::Url::parse(origin).expect("test origin"));
    }
}

async fn handle_proxy(State(engine): State<Arc<ProxyEngine>>, req: Request) -> Response {
    engine.serve(req).await
}

fn constant_time_str_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let max_len = left_bytes.len().max(right_bytes.len());
    let mut diff = left_bytes.len() ^ right_bytes.len();

    for i in 0..max_len {
        let l = left_bytes.get(i).copied().unwrap_or(0);
        let r = right_bytes.get(i).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }

    diff == 0
}

fn is_forwardable_header(name: &str) -> bool {
    !matches!(
        name,
        "host"
            | "connection"
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

fn error_response(status: u16, message: &str) -> Response {
    let body = json!({ "error": message });
    (
        axum::http::StatusCode::from_u16(status).unwrap_or(axum::http::StatusCode::BAD_GATEWAY),
        axum::Json(body),
    )
        .into_response()
}
