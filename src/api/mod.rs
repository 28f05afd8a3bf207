// Management REST surface consumed by the GUI: accounts CRUD, quota and
// rate-limit views, validation triggers, and proxy lifecycle control. Reads
// and writes all flow through the store; secrets never leave in responses.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::models::{AccountStatus, AccountUpdate, NewAccount, ProxyConfig, RoutingStrategy};
use crate::providers;
use crate::proxy::ProxyEngine;
use crate::quota::QuotaTracker;
use crate::store::Store;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<Store>,
    pub router: Arc<crate::proxy::Router>,
    pub tracker: Arc<QuotaTracker>,
    pub engine: Arc<ProxyEngine>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn internal_error<E: std::fmt::Display>(e: E) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

fn not_found(message: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

pub fn build_router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/dashboard", get(handle_dashboard))
        .route("/api/providers", get(list_providers).post(add_provider))
        .route("/api/providers/status", get(provider_status))
        .route("/api/providers/detect", get(detect_env_providers))
        .route("/api/providers/detect-oauth", get(detect_oauth))
        .route("/api/providers/from-oauth", post(add_provider_from_oauth))
        .route("/api/providers/health", get(list_provider_health))
        .route("/api/providers/health/:id", post(check_provider_health))
        .route(
            "/api/providers/:id",
            axum::routing::put(update_provider).delete(delete_provider),
        )
        .route("/api/quota", get(quota_status))
        .route("/api/quota/history/:id", get(quota_history))
        .route("/api/quota/failed", get(failed_requests))
        .route("/api/quota/reset/:id", post(reset_quota))
        .route("/api/rate-limits", get(rate_limits))
        .route("/api/routing-strategy", post(update_routing_strategy))
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/agents", get(list_agents))
        .route("/api/agents/refresh", post(refresh_agents))
        .route("/api/proxy/start", post(start_proxy))
        .route("/api/proxy/stop", post(stop_proxy))
        .route("/api/proxy/status", get(proxy_status))
        .layer(cors)
        .with_state(state)
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "time": Utc::now().timestamp(),
    }))
}

async fn handle_dashboard(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let accounts = state.store.list_accounts().map_err(internal_error)?;
    let active = accounts
        .iter()
        .filter(|acc| acc.status == AccountStatus::Active)
        .count();

    let mut per_provider: HashMap<&str, i64> = HashMap::new();
    for account in &accounts {
        if account.status != AccountStatus::Disabled {
            *per_provider.entry(account.provider.as_str()).or_default() += 1;
        }
    }
    let providers: Vec<_> = per_provider
        .into_iter()
        .map(|(provider, count)| json!({ "provider": provider, "accounts": count }))
        .collect();

    let (requests_today, tokens_today, successes_today) =
        state.store.usage_today().map_err(internal_error)?;
    let success_rate = if requests_today > 0 {
        successes_today as f64 / requests_today as f64
    } else {
        0.0
    };

    Ok(Json(json!({
        "server_status": "running",
        "proxy_running": state.engine.is_running().await,
        "proxy_port": state.engine.port().await,
        "active_accounts": active,
        "total_accounts": accounts.len(),
        "requests_today": requests_today,
        "tokens_today": tokens_today,
        "success_rate": success_rate,
        "providers": providers,
    })))
}

async fn list_providers(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let accounts = state.store.list_accounts().map_err(internal_error)?;
    let mut result = Vec::with_capacity(accounts.len());
    for account in accounts {
        let health = state.store.health(account.id).map_err(internal_error)?;
        let mut entry = serde_json::to_value(account.sanitized()).map_err(internal_error)?;
        if let Some(object) = entry.as_object_mut() {
            match health {
                Some(health) => {
                    object.insert("is_healthy".to_string(), json!(health.is_healthy));
                    object.insert(
                        "response_time_ms".to_string(),
                        json!(health.response_time_ms),
                    );
                    object.insert("last_checked".to_string(), json!(health.last_checked));
                }
                None => {
                    object.insert("is_healthy".to_string(), json!(true));
                    object.insert("response_time_ms".to_string(), json!(0));
                    object.insert("last_checked".to_string(), serde_json::Value::Null);
                }
            }
        }
        result.push(entry);
    }
    Ok(Json(result))
}

async fn provider_status(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let accounts = state.store.list_accounts().map_err(internal_error)?;
    let mut by_provider: HashMap<String, (i64, i64, i64, i64)> = HashMap::new();
    for account in &accounts {
        let entry = by_provider.entry(account.provider.clone()).or_default();
        entry.3 += 1;
        match account.status {
            AccountStatus::Active => entry.0 += 1,
            AccountStatus::RateLimited => entry.1 += 1,
            AccountStatus::Cooldown => entry.2 += 1,
            AccountStatus::Disabled => {}
        }
    }
    let statuses: Vec<_> = by_provider
        .into_iter()
        .map(|(provider, (active, limited, cooldown, total))| {
            json!({
                "provider": provider,
                "active_accounts": active,
                "limited_accounts": limited,
                "cooldown_accounts": cooldown,
                "total_accounts": total,
            })
        })
        .collect();
    Ok(Json(statuses))
}

async fn add_provider(
    State(state): State<ApiState>,
    Json(payload): Json<NewAccount>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.provider.is_empty() {
        return Err(bad_request("provider is required"));
    }
    let account = state
        .store
        .create_account(payload)
        .map_err(internal_error)?;
    info!("Account {} created for provider {}", account.id, account.provider);
    Ok((StatusCode::CREATED, Json(account.sanitized())))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct UpdateProviderRequest {
    name: Option<String>,
    api_key: Option<String>,
    oauth_token: Option<String>,
    refresh_token: Option<String>,
    quota_limit: Option<i64>,
    quota_used: Option<i64>,
    quota_manual: Option<bool>,
    status: Option<AccountStatus>,
    priority: Option<i64>,
    model_access: Option<Vec<String>>,
}

async fn update_provider(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Json(payload): Json<UpdateProviderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Only the requested columns go into the update; quota_used and status
    // are left to their own atomic paths unless this request names them.
    let mut update = AccountUpdate {
        name: payload.name,
        api_key: payload.api_key,
        oauth_token: payload.oauth_token,
        refresh_token: payload.refresh_token,
        quota_limit: payload.quota_limit,
        quota_used: payload.quota_used,
        quota_manual: payload.quota_manual,
        status: payload.status,
        priority: payload.priority,
        model_access: payload.model_access,
        ..AccountUpdate::default()
    };
    if update.quota_limit.is_some() && update.quota_manual.is_none() {
        // An explicit limit from the operator pins the quota.
        update.quota_manual = Some(true);
        update.quota_auto_detected = Some(false);
    }

    let updated = state.store.update_fields(id, update).map_err(|e| match e {
        crate::error::AppError::Account(ref message) if message.contains("not found") => {
            not_found("Account not found")
        }
        other => internal_error(other),
    })?;
    Ok(Json(updated.sanitized()))
}

async fn delete_provider(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.delete_account(id).map_err(internal_error)?;
    Ok(Json(json!({ "message": "Account deleted" })))
}

async fn detect_env_providers() -> impl IntoResponse {
    let detected: Vec<_> = providers::detect_env_accounts()
        .into_iter()
        .map(|candidate| {
            json!({
                "provider": candidate.provider,
                "name": candidate.name,
                "auto_detected": true,
            })
        })
        .collect();
    Json(detected)
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DetectOAuthQuery {
    provider: Option<String>,
}

async fn detect_oauth(Query(query): Query<DetectOAuthQuery>) -> impl IntoResponse {
    match query.provider {
        Some(provider) => match providers::oauth::detect_credentials(&provider) {
            Some((path, creds)) => Json(json!({
                "found": true,
                "path": path.display().to_string(),
                "expires_at": creds.expires_at,
                "token_type": creds.token_type,
            })),
            None => Json(json!({
                "found": false,
                "message": format!("No OAuth credentials found for {}", provider),
            })),
        },
        None => {
            let found = providers::oauth::detect_all();
            let result: HashMap<&str, serde_json::Value> = found
                .iter()
                .map(|(provider, (path, creds))| {
                    (
                        *provider,
                        json!({
                            "found": true,
                            "path": path.display().to_string(),
                            "expires_at": creds.expires_at,
                            "token_type": creds.token_type,
                        }),
                    )
                })
                .collect();
            Json(json!({ "providers": result, "count": found.len() }))
        }
    }
}

#[derive(Deserialize)]
struct FromOAuthRequest {
    provider: String,
}

async fn add_provider_from_oauth(
    State(state): State<ApiState>,
    Json(payload): Json<FromOAuthRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some((_, creds)) = providers::oauth::detect_credentials(&payload.provider) else {
        return Err(not_found(&format!(
            "No OAuth credentials found for {}",
            payload.provider
        )));
    };

    let account = state
        .store
        .create_account(NewAccount {
            provider: payload.provider.clone(),
            name: format!("{} (OAuth)", payload.provider),
            oauth_token: creds.access_token,
            refresh_token: creds.refresh_token,
            token_expires_at: creds.expires_at,
            auto_detected: true,
            ..NewAccount::default()
        })
        .map_err(internal_error)?;

    // Validate out of band; a rejected credential disables the new account.
    let store = state.store.clone();
    let probe = account.clone();
    tokio::spawn(async move {
        let report = providers::validation::validate_account(&probe).await;
        if let Err(e) =
            store.record_validation(probe.id, report.outcome.is_valid(), report.response_time_ms)
        {
            error!("Failed to persist validation for account {}: {}", probe.id, e);
        }
        if report.outcome == providers::validation::ValidationOutcome::InvalidCredentials {
            if let Err(e) = store.set_status(probe.id, AccountStatus::Disabled) {
                error!("Failed to disable account {}: {}", probe.id, e);
            }
        }
    });

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "message": "Provider added from OAuth credentials",
            "account": account.id,
        })),
    ))
}

async fn list_provider_health(
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, ApiError> {
    let records = state.store.list_health().map_err(internal_error)?;
    let mut result = Vec::with_capacity(records.len());
    for health in records {
        if let Ok(account) = state.store.get_account(health.account_id) {
            result.push(json!({
                "account_id": health.account_id,
                "provider_name": account.provider,
                "account_name": account.name,
                "is_healthy": health.is_healthy,
                "response_time_ms": health.response_time_ms,
                "last_checked": health.last_checked,
                "consecutive_failures": health.consecutive_failures,
            }));
        }
    }
    Ok(Json(result))
}

async fn check_provider_health(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let account = state
        .store
        .get_account(id)
        .map_err(|_| not_found("Account not found"))?;

    let report = providers::validation::validate_account(&account).await;
    state
        .store
        .record_validation(id, report.outcome.is_valid(), report.response_time_ms)
        .map_err(internal_error)?;
    if report.outcome == providers::validation::ValidationOutcome::InvalidCredentials {
        state
            .store
            .set_status(id, AccountStatus::Disabled)
            .map_err(internal_error)?;
    }

    // A healthy probe is a chance to refresh quota from the provider's own
    // numbers, when the adapter can supply them.
    if report.outcome.is_valid() {
        if let Some(adapter) = providers::get(&account.provider) {
            let (used, limit) = adapter.fetch_quota(&account);
            if used > 0 || limit > 0 {
                let limits = providers::RateLimitInfo {
                    tokens_limit: limit,
                    tokens_remaining: limit - used,
                    ..providers::RateLimitInfo::default()
                };
                state
                    .store
                    .apply_rate_limits(id, &limits)
                    .map_err(internal_error)?;
            }
        }
    }

    Ok(Json(json!({
        "account_id": id,
        "is_healthy": report.outcome.is_valid(),
        "validation_reason": report.outcome.reason(),
        "error_message": report.error,
        "response_time_ms": report.response_time_ms,
        "last_checked": Utc::now().timestamp(),
    })))
}

async fn quota_status(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let accounts = state.store.list_accounts().map_err(internal_error)?;
    let mut result = Vec::new();
    for account in accounts {
        if account.status == AccountStatus::Disabled {
            continue;
        }
        let model_usage = state
            .store
            .model_usage(account.id)
            .map_err(internal_error)?;
        let health = state.store.health(account.id).map_err(internal_error)?;
        let auto_detected_limit = if account.quota_manual {
            0
        } else {
            account.rate_limit_tokens
        };
        let mut entry = serde_json::to_value(account.sanitized()).map_err(internal_error)?;
        if let Some(object) = entry.as_object_mut() {
            object.insert("model_usage".to_string(), json!(model_usage));
            object.insert(
                "is_healthy".to_string(),
                json!(health.as_ref().map(|h| h.is_healthy).unwrap_or(true)),
            );
            object.insert(
                "response_time_ms".to_string(),
                json!(health.as_ref().map(|h| h.response_time_ms).unwrap_or(0)),
            );
            object.insert(
                "auto_detected_limit".to_string(),
                json!(auto_detected_limit),
            );
        }
        result.push(entry);
    }
    Ok(Json(result))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn quota_history(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = state
        .store
        .quota_history(id, query.limit.unwrap_or(50))
        .map_err(internal_error)?;
    Ok(Json(entries))
}

async fn failed_requests(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let entries = state
        .store
        .failed_requests(query.limit.unwrap_or(50))
        .map_err(internal_error)?;
    Ok(Json(entries))
}

async fn reset_quota(
    State(state): State<ApiState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.store.get_account(id).map_err(|_| not_found("Account not found"))?;
    state.tracker.reset(id).map_err(internal_error)?;
    info!("Quota reset for account {}", id);
    Ok(Json(json!({ "message": "Quota reset successfully" })))
}

async fn rate_limits(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let accounts = state.store.list_accounts().map_err(internal_error)?;
    let mut result = Vec::new();
    for account in accounts {
        if account.status == AccountStatus::Disabled {
            continue;
        }
        let health = state.store.health(account.id).map_err(internal_error)?;
        result.push(json!({
            "account_id": account.id,
            "provider": account.provider,
            "name": account.name,
            "status": account.status,
            "requests_limit": account.rate_limit_requests,
            "requests_remaining": account.rate_limit_requests_remaining,
            "requests_reset": account.rate_limit_requests_reset,
            "tokens_limit": account.rate_limit_tokens,
            "tokens_remaining": account.rate_limit_tokens_remaining,
            "tokens_reset": account.rate_limit_tokens_reset,
            "quota_limit": account.quota_limit,
            "quota_used": account.quota_used,
            "quota_auto_detected": account.quota_auto_detected,
            "quota_manual": account.quota_manual,
            "cooldown_until": account.cooldown_until,
            "response_time_ms": health.as_ref().map(|h| h.response_time_ms).unwrap_or(0),
            "last_checked": health.as_ref().and_then(|h| h.last_checked),
        }));
    }
    Ok(Json(result))
}

#[derive(Deserialize)]
struct RoutingStrategyRequest {
    strategy: String,
}

async fn update_routing_strategy(
    State(state): State<ApiState>,
    Json(payload): Json<RoutingStrategyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.strategy != "round_robin" && payload.strategy != "fill_first" {
        return Err(bad_request(
            "Invalid strategy. Use 'round_robin' or 'fill_first'",
        ));
    }
    let strategy = RoutingStrategy::parse(&payload.strategy);
    state
        .store
        .set_routing_strategy(strategy)
        .map_err(internal_error)?;
    state.router.set_strategy(strategy);
    Ok(Json(json!({
        "message": "Routing strategy updated",
        "strategy": payload.strategy,
    })))
}

async fn get_settings(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let config = state.store.proxy_config().map_err(internal_error)?;
    Ok(Json(config))
}

async fn update_settings(
    State(state): State<ApiState>,
    Json(payload): Json<ProxyConfig>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .store
        .save_proxy_config(&payload)
        .map_err(internal_error)?;
    state.router.set_strategy(payload.routing_strategy);
    Ok(Json(payload))
}

async fn list_agents(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let agents = state.store.list_agents().map_err(internal_error)?;
    if agents.is_empty() {
        let proxy_url = format!("http://127.0.0.1:{}", state.engine.port().await);
        let detected =
            crate::agents::refresh(&state.store, &proxy_url).map_err(internal_error)?;
        return Ok(Json(detected));
    }
    Ok(Json(agents))
}

async fn refresh_agents(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let proxy_url = format!("http://127.0.0.1:{}", state.engine.port().await);
    let agents = crate::agents::refresh(&state.store, &proxy_url).map_err(internal_error)?;
    Ok(Json(agents))
}

async fn start_proxy(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    state.engine.start().await.map_err(internal_error)?;
    Ok(Json(json!({ "message": "Proxy started" })))
}

async fn stop_proxy(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    if !state.engine.is_running().await {
        return Err(bad_request("Proxy not running"));
    }
    state.engine.stop().await;
    Ok(Json(json!({ "message": "Proxy stopped" })))
}

async fn proxy_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({
        "running": state.engine.is_running().await,
        "port": state.engine.port().await,
    }))
}
