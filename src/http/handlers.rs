//! Route handlers and shared state.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{ApiError, LogForwarder};
use crate::metrics::MetricsRegistry;
use crate::ratelimit::{Decision, RateLimiter};

/// Identity used when a caller does not name one.
pub const ANONYMOUS_USER: &str = "anonymous";

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsRegistry>,
    pub api_key: Option<Arc<str>>,
    pub log_forwarder: Option<LogForwarder>,
}

impl AppState {
    pub fn new(
        limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsRegistry>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            limiter,
            metrics,
            api_key: api_key.map(Arc::from),
            log_forwarder: None,
        }
    }

    /// Relay `POST /api/log` payloads through `forwarder`.
    pub fn with_log_forwarder(mut self, forwarder: LogForwarder) -> Self {
        self.log_forwarder = Some(forwarder);
        self
    }
}

fn key_matches(presented: Option<&str>, expected: &str) -> bool {
    presented
        .map(|key| key.as_bytes().ct_eq(expected.as_bytes()).into())
        .unwrap_or(false)
}

/// Build the router for all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/limiter", get(check_limit))
        .route("/api/metrics", get(render_metrics))
        .route("/api/log", post(ingest_log))
        .route("/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct LimiterQuery {
    user: Option<String>,
    key: Option<String>,
}

#[derive(Debug, Serialize)]
struct LimiterResponse {
    user: String,
    #[serde(flatten)]
    decision: Decision,
}

/// `GET /api/limiter?user=..&key=..`
#[instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
async fn check_limit(
    State(state): State<AppState>,
    Query(query): Query<LimiterQuery>,
) -> Result<Json<LimiterResponse>, ApiError> {
    let user = query
        .user
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| ANONYMOUS_USER.to_string());

    if let Some(expected) = &state.api_key {
        if !key_matches(query.key.as_deref(), expected) {
            warn!(event = "auth_failed", user = %user, "Rejected request with invalid API key");
            return Err(ApiError::Unauthorized("invalid key".to_string()));
        }
    }

    let decision = state.limiter.allow_and_consume(&user).await.map_err(|e| {
        warn!(user = %user, error = %e, "Rate limit check failed");
        ApiError::ServiceUnavailable(e.to_string())
    })?;

    info!(
        event = "rate_check",
        user = %user,
        allowed = decision.allowed,
        remaining = decision.remaining,
        "Rate limit decision made"
    );

    Ok(Json(LimiterResponse { user, decision }))
}

/// `GET /api/metrics`
async fn render_metrics(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let body = state.metrics.render_prometheus().map_err(|e| {
        warn!(error = %e, "Failed to render metrics");
        ApiError::Internal(e.to_string())
    })?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}

/// `POST /api/log`
///
/// Client-side logs are re-emitted through the service's own tracing
/// subscriber and relayed to the log forwarder when one is configured.
/// A failed relay never fails the request.
async fn ingest_log(State(state): State<AppState>, Json(payload): Json<Value>) -> Json<Value> {
    info!(event = "forwarded_log", payload = %payload, "Client log received");

    if let Some(forwarder) = &state.log_forwarder {
        if let Err(e) = forwarder.forward(&payload).await {
            warn!(url = forwarder.url(), error = %e, "Log forward failed");
        }
    }

    Json(json!({ "ok": true }))
}

/// `GET /health`
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBucketStore;
    use axum::body::Body;
    use axum::http::{HeaderMap, Request, StatusCode};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn test_state(capacity: f64, api_key: Option<&str>) -> AppState {
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let limiter = RateLimiter::new(
            capacity,
            1.0,
            Arc::new(MemoryBucketStore::new()),
            metrics.clone(),
        )
        .unwrap();

        AppState::new(Arc::new(limiter), metrics, api_key.map(str::to_string))
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, String) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_limiter_endpoint_counts_down() {
        let router = create_router(test_state(2.0, None));

        let (status, body) = call(router.clone(), get_request("/api/limiter?user=alice")).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body, json!({ "user": "alice", "allowed": true, "remaining": 1 }));

        call(router.clone(), get_request("/api/limiter?user=alice")).await;
        let (_, body) = call(router, get_request("/api/limiter?user=alice")).await;
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["allowed"], false);
        assert_eq!(body["remaining"], 0);
    }

    #[tokio::test]
    async fn test_missing_user_is_anonymous() {
        let router = create_router(test_state(5.0, None));

        let (status, body) = call(router, get_request("/api/limiter")).await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["user"], "anonymous");
    }

    #[tokio::test]
    async fn test_api_key_enforced() {
        let router = create_router(test_state(5.0, Some("secret")));

        let (status, body) = call(router.clone(), get_request("/api/limiter?user=bob&key=wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(
            serde_json::from_str::<Value>(&body).unwrap(),
            json!({ "error": "invalid key" })
        );

        let (status, _) = call(router.clone(), get_request("/api/limiter?user=bob")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = call(router, get_request("/api/limiter?user=bob&key=secret")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let state = test_state(5.0, None);
        let router = create_router(state);

        call(router.clone(), get_request("/api/limiter?user=carol")).await;

        let response = router
            .oneshot(get_request("/api/metrics"))
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();

        assert!(body.contains("rate_requests_total 1\n"));
        assert!(body.contains("rate_tokens_remaining{user=\"carol\"} 4"));
    }

    #[tokio::test]
    async fn test_log_endpoint() {
        let router = create_router(test_state(5.0, None));
        let request = Request::builder()
            .method("POST")
            .uri("/api/log")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"level":"error","msg":"boom"}"#))
            .unwrap();

        let (status, body) = call(router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({ "ok": true }));
    }

    type Received = (Option<String>, Value);

    /// Local collector that hands every received log back to the test.
    async fn spawn_collector() -> (String, mpsc::UnboundedReceiver<Received>) {
        let (tx, rx) = mpsc::unbounded_channel::<Received>();
        let collector = Router::new().route(
            "/ingest",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let tx = tx.clone();
                async move {
                    let key = headers
                        .get("x-api-key")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    let _ = tx.send((key, body));
                    StatusCode::NO_CONTENT
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, collector).await.unwrap();
        });

        (format!("http://{addr}/ingest"), rx)
    }

    fn log_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/log")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_log_endpoint_forwards_payload() {
        let (url, mut received) = spawn_collector().await;
        let forwarder = LogForwarder::new(url, Some("collector-key".to_string())).unwrap();
        let router = create_router(test_state(5.0, None).with_log_forwarder(forwarder));

        let (status, body) = call(router, log_request(r#"{"level":"warn","msg":"slow"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({ "ok": true }));

        let (key, payload) = received.recv().await.unwrap();
        assert_eq!(key.as_deref(), Some("collector-key"));
        assert_eq!(payload, json!({ "level": "warn", "msg": "slow" }));
    }

    #[tokio::test]
    async fn test_log_endpoint_forwards_without_key() {
        let (url, mut received) = spawn_collector().await;
        let forwarder = LogForwarder::new(url, None).unwrap();
        let router = create_router(test_state(5.0, None).with_log_forwarder(forwarder));

        call(router, log_request(r#"{"msg":"hi"}"#)).await;

        let (key, payload) = received.recv().await.unwrap();
        assert_eq!(key, None);
        assert_eq!(payload, json!({ "msg": "hi" }));
    }

    #[tokio::test]
    async fn test_log_endpoint_survives_unreachable_collector() {
        // Reserve a port, then close it so nothing is listening there.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = LogForwarder::new(format!("http://{addr}/ingest"), None).unwrap();
        let router = create_router(test_state(5.0, None).with_log_forwarder(forwarder));

        let (status, body) = call(router, log_request(r#"{"msg":"lost"}"#)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&body).unwrap(), json!({ "ok": true }));
    }

    #[test]
    fn test_key_matches() {
        assert!(key_matches(Some("secret"), "secret"));
        assert!(!key_matches(Some("secreT"), "secret"));
        assert!(!key_matches(Some("secret-longer"), "secret"));
        assert!(!key_matches(Some(""), "secret"));
        assert!(!key_matches(None, "secret"));
    }

    #[tokio::test]
    async fn test_health() {
        let router = create_router(test_state(5.0, None));

        let (status, body) = call(router, get_request("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["status"], "ok");
    }
}
