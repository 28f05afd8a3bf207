// Out-of-band credential probe: a single authenticated GET against the
// provider's validation endpoint with a hard deadline. Never touches the
// routing path; the caller persists the outcome.

use reqwest::header::HeaderMap;
use std::time::{Duration, Instant};

use crate::constants::VALIDATION_TIMEOUT_SECS;
use crate::models::Account;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    InvalidCredentials,
    RateLimited,
    Http(u16),
    NetworkError,
}

impl ValidationOutcome {
    pub fn reason(&self) -> String {
        match self {
            ValidationOutcome::Valid => "success".to_string(),
            ValidationOutcome::InvalidCredentials => "invalid_credentials".to_string(),
            ValidationOutcome::RateLimited => "rate_limited".to_string(),
            ValidationOutcome::Http(code) => format!("http_{}", code),
            ValidationOutcome::NetworkError => "network_error".to_string(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub outcome: ValidationOutcome,
    pub response_time_ms: i64,
    pub error: Option<String>,
}

impl ValidationReport {
    fn failed(outcome: ValidationOutcome, error: String, started: Instant) -> Self {
        Self {
            outcome,
            response_time_ms: started.elapsed().as_millis() as i64,
            error: Some(error),
        }
    }
}

pub async fn validate_account(account: &Account) -> ValidationReport {
    let started = Instant::now();
    match super::get(&account.provider) {
        Some(adapter) => validate_against(adapter.base_url(), account).await,
        None => ValidationReport::failed(
            ValidationOutcome::NetworkError,
            format!("provider {} not supported", account.provider),
            started,
        ),
    }
}

// Split out so tests can point the probe at a local mock origin.
pub(crate) async fn validate_against(base_url: &str, account: &Account) -> ValidationReport {
    let started = Instant::now();

    let Some(adapter) = super::get(&account.provider) else {
        return ValidationReport::failed(
            ValidationOutcome::NetworkError,
            format!("provider {} not supported", account.provider),
            started,
        );
    };

    let mut url = match reqwest::Url::parse(&format!(
        "{}{}",
        base_url,
        adapter.validation_endpoint()
    )) {
        Ok(url) => url,
        Err(e) => {
            return ValidationReport::failed(
                ValidationOutcome::NetworkError,
                e.to_string(),
                started,
            )
        }
    };

    let mut headers = HeaderMap::new();
    if let Err(e) = adapter.authenticate(&mut headers, &mut url, account) {
        return ValidationReport::failed(ValidationOutcome::NetworkError, e.to_string(), started);
    }

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(VALIDATION_TIMEOUT_SECS))
        .user_agent(crate::constants::USER_AGENT.as_str())
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            return ValidationReport::failed(
                ValidationOutcome::NetworkError,
                e.to_string(),
                started,
            )
        }
    };

    let response = match client.get(url).headers(headers).send().await {
        Ok(response) => response,
        Err(e) => {
            return ValidationReport::failed(
                ValidationOutcome::NetworkError,
                e.to_string(),
                started,
            )
        }
    };

    let outcome = match response.status().as_u16() {
        200 => ValidationOutcome::Valid,
        401 | 403 => ValidationOutcome::InvalidCredentials,
        429 => ValidationOutcome::RateLimited,
        code => ValidationOutcome::Http(code),
    };
    ValidationReport {
        outcome,
        response_time_ms: started.elapsed().as_millis() as i64,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::HeaderMap as AxumHeaderMap;
    use axum::{routing::get, Router};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Clone, Default)]
    struct SeenAuth {
        value: Arc<AsyncMutex<Option<String>>>,
    }

    async fn start_mock(status: u16, seen: SeenAuth) -> String {
        let app = Router::new()
            .route(
                "/v1/models",
                get(move |State(seen): State<SeenAuth>, headers: AxumHeaderMap| async move {
                    *seen.value.lock().await = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.to_string());
                    (
                        axum::http::StatusCode::from_u16(status).unwrap(),
                        "{}".to_string(),
                    )
                }),
            )
            .with_state(seen);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock");
        });
        format!("http://{}", addr)
    }

    fn openai_account(api_key: &str) -> Account {
        let mut account = crate::models::test_account();
        account.provider = "openai".into();
        account.api_key = api_key.into();
        account
    }

    #[test]
    fn outcome_reasons_match_wire_vocabulary() {
        assert_eq!(ValidationOutcome::Valid.reason(), "success");
        assert_eq!(
            ValidationOutcome::InvalidCredentials.reason(),
            "invalid_credentials"
        );
        assert_eq!(ValidationOutcome::RateLimited.reason(), "rate_limited");
        assert_eq!(ValidationOutcome::Http(503).reason(), "http_503");
        assert_eq!(ValidationOutcome::NetworkError.reason(), "network_error");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unknown_provider_reports_network_error() {
        let mut account = crate::models::test_account();
        account.provider = "no-such-provider".into();
        let report = validate_account(&account).await;
        assert_eq!(report.outcome, ValidationOutcome::NetworkError);
        assert!(report.error.is_some());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn probe_authenticates_and_maps_success() {
        let seen = SeenAuth::default();
        let base = start_mock(200, seen.clone()).await;
        let report = validate_against(&base, &openai_account("sk-check")).await;
        assert_eq!(report.outcome, ValidationOutcome::Valid);
        assert!(report.response_time_ms >= 0);
        assert_eq!(
            seen.value.lock().await.as_deref(),
            Some("Bearer sk-check")
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn probe_maps_auth_rejection_and_rate_limits() {
        for (status, expected) in [
            (401, ValidationOutcome::InvalidCredentials),
            (403, ValidationOutcome::InvalidCredentials),
            (429, ValidationOutcome::RateLimited),
            (503, ValidationOutcome::Http(503)),
        ] {
            let base = start_mock(status, SeenAuth::default()).await;
            let report = validate_against(&base, &openai_account("sk-check")).await;
            assert_eq!(report.outcome, expected, "status {}", status);
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unreachable_origin_reports_network_error() {
        let report =
            validate_against("http://127.0.0.1:9", &openai_account("sk-check")).await;
        assert_eq!(report.outcome, ValidationOutcome::NetworkError);
    }
}
