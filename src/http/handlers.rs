//! Request handlers for the sidecar.

use axum::{
    extract::State,
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{instrument, warn};

use crate::admission::{Admission, AdmissionResponse};
use crate::error::Result;
use crate::ratelimit::RequestIdentity;
use crate::telemetry::Stats;

/// Shared application state.
pub struct AppState {
    pub admission: Admission,
}

/// Body of an admitted request.
#[derive(Debug, Serialize)]
struct AdmitBody {
    allowed: bool,
    degraded: bool,
}

/// Administrative whitelist or blacklist request.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminRequest {
    /// Rendered key such as `ip:10.0.0.1` or `user:42`
    pub key: String,
    /// Entry lifetime; the configured default when absent
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminResponse {
    pub key: String,
    pub expires_at: u64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "bouncer",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Decide one proxied request.
#[instrument(skip_all, fields(ip = %identity.ip, method = %identity.method, path = %identity.path))]
pub(crate) async fn admit(
    State(state): State<Arc<AppState>>,
    Json(identity): Json<RequestIdentity>,
) -> Response {
    let decision = state.admission.admit(&identity).await;
    let status = StatusCode::from_u16(decision.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = match &decision {
        AdmissionResponse::Admit { degraded, .. } => (
            status,
            Json(AdmitBody {
                allowed: true,
                degraded: *degraded,
            }),
        )
            .into_response(),
        AdmissionResponse::Reject(rejection) => (status, Json(rejection.clone())).into_response(),
    };

    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

pub(crate) async fn whitelist(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AdminRequest>,
) -> Response {
    if req.key.trim().is_empty() {
        return invalid_key();
    }
    let result = state.admission.whitelist(&req.key, req.duration_ms).await;
    admin_response(req.key, result)
}

pub(crate) async fn blacklist(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AdminRequest>,
) -> Response {
    if req.key.trim().is_empty() {
        return invalid_key();
    }
    let result = state.admission.blacklist(&req.key, req.duration_ms).await;
    admin_response(req.key, result)
}

fn invalid_key() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: "key must not be empty".to_string(),
            code: "INVALID_KEY",
        }),
    )
        .into_response()
}

fn admin_response(key: String, result: Result<u64>) -> Response {
    match result {
        Ok(expires_at) => (StatusCode::OK, Json(AdminResponse { key, expires_at })).into_response(),
        Err(e) => {
            warn!(key = %key, error = %e, "Administrative update failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: e.to_string(),
                    code: "STORE_UNAVAILABLE",
                }),
            )
                .into_response()
        }
    }
}

pub(crate) async fn stats(State(state): State<Arc<AppState>>) -> Json<Stats> {
    Json(state.admission.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{BouncerConfig, TelemetryConfig};
    use crate::http::router;
    use crate::ratelimit::{Dimension, LimitRule};
    use crate::store::MemoryStore;
    use crate::telemetry::Telemetry;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(max_requests: u64) -> axum::Router {
        let mut config = BouncerConfig::default();
        config.limits = config
            .limits
            .with_dimension(Dimension::Global, None)
            .with_dimension(Dimension::Ip, Some(LimitRule::new(60_000, max_requests)));
        let (telemetry, _) = Telemetry::spawn(&TelemetryConfig::default());
        let admission = Admission::from_config(
            &config,
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(0)),
            telemetry,
        );
        router(Arc::new(AppState { admission }))
    }

    fn post(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const IDENTITY: &str = r#"{"ip":"10.0.0.1","method":"GET","path":"/courses"}"#;

    #[tokio::test]
    async fn test_health() {
        let response = app(1)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_admit_then_reject() {
        let app = app(1);

        let response = app.clone().oneshot(post("/v1/admit", IDENTITY)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");

        let response = app.oneshot(post("/v1/admit", IDENTITY)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "60");
        let body = json(response).await;
        assert_eq!(body["allowed"], false);
        assert_eq!(body["dimension"], "ip");
        assert_eq!(body["max"], 1);
    }

    #[tokio::test]
    async fn test_admin_whitelist() {
        let app = app(0);

        let response = app
            .clone()
            .oneshot(post(
                "/v1/admin/whitelist",
                r#"{"key":"ip:10.0.0.1","duration_ms":5000}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["expires_at"], 5_000);

        let response = app.oneshot(post("/v1/admit", IDENTITY)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_admin_rejects_empty_key() {
        let response = app(1)
            .oneshot(post("/v1/admin/blacklist", r#"{"key":" "}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats() {
        let response = app(1)
            .oneshot(Request::get("/v1/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["dropped_events"], 0);
    }
}
