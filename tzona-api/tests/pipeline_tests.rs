//! End-to-end tests for the request pipeline: trace propagation, the
//! availability gate, URL input sanitising and performance sampling.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::RETRY_AFTER, StatusCode},
    response::Response,
    routing::get,
    Extension, Json, Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use tzona_api::{build_router, build_router_with, ApiConfig, ApiResult, AppState, DbClient, SanitizedInput};
use tzona_core::TRACE_HEADER;
use tzona_storage::{DataStore, InMemoryStore};
use tzona_test_utils::assertions::{assert_error_envelope, assert_trace_id};
use tzona_test_utils::{errors, FlakyStore};

// ============================================================================
// HELPERS
// ============================================================================

async fn echo_slug(Extension(input): Extension<SanitizedInput>) -> Json<Value> {
    Json(json!({
        "slug": input.param("slug"),
        "tag": input.query_value("tag"),
    }))
}

async fn find_session(
    State(db): State<DbClient>,
    Extension(input): Extension<SanitizedInput>,
) -> ApiResult<Json<Value>> {
    let id = input.param("id").unwrap_or_default();
    let record = db.find("sessions", id).await?;
    Ok(Json(json!({ "success": true, "data": record })))
}

fn app(state: AppState) -> Router {
    let routes = tzona_api::routes::create_routes()
        .route("/api/exercises/:slug", get(echo_slug))
        .route("/api/sessions/:id", get(find_session));
    build_router_with(routes, state)
}

fn get_request(uri: &str) -> Request {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// TRACE PROPAGATION
// ============================================================================

#[tokio::test]
async fn test_inbound_trace_id_is_echoed() {
    let app = build_router(AppState::in_memory(ApiConfig::default()));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health/live")
                .header(TRACE_HEADER, "trace-abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()[TRACE_HEADER], "trace-abc");
}

#[tokio::test]
async fn test_request_id_is_used_when_trace_header_is_blank() {
    let app = build_router(AppState::in_memory(ApiConfig::default()));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health/live")
                .header(TRACE_HEADER, "   ")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()[TRACE_HEADER], "req-42");
}

#[tokio::test]
async fn test_trace_id_is_minted_when_absent() {
    let app = build_router(AppState::in_memory(ApiConfig::default()));
    let response = app.oneshot(get_request("/health/live")).await.unwrap();
    let minted = response.headers()[TRACE_HEADER].to_str().unwrap();
    assert!(!minted.trim().is_empty());
}

// ============================================================================
// AVAILABILITY GATE
// ============================================================================

#[tokio::test]
async fn test_gate_returns_503_with_retry_after() {
    let state = AppState::in_memory(ApiConfig::default());
    state
        .availability()
        .mark_unavailable(&errors::connectivity(), Some(Duration::from_millis(4500)));

    let response = app(state)
        .oneshot(
            Request::builder()
                .uri("/api/sessions/abc")
                .header(TRACE_HEADER, "gate-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()[RETRY_AFTER], "5");
    let body = json_body(response).await;
    assert_error_envelope(&body, "service_unavailable");
    assert_trace_id(&body, "gate-1");
    assert_eq!(body["error"]["resource"], "sessions/abc");
    assert_eq!(body["error"]["details"]["code"], "08006");
}

#[tokio::test]
async fn test_health_bypasses_closed_gate() {
    let state = AppState::in_memory(ApiConfig::default());
    state
        .availability()
        .mark_unavailable(&errors::connectivity(), None);

    let response = app(state).oneshot(get_request("/api/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["dependencies"]["database"]["unavailable"], true);
}

#[tokio::test]
async fn test_lost_connectivity_trips_gate() {
    let store = Arc::new(InMemoryStore::new());
    store.set_offline(true);
    let state = AppState::with_store(ApiConfig::default(), store.clone() as Arc<dyn DataStore>);
    let app = app(state.clone());

    let first = app.clone().oneshot(get_request("/api/sessions/abc")).await.unwrap();
    assert_eq!(first.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(state.availability().is_temporarily_unavailable());

    // The second request never reaches the store.
    store.set_offline(false);
    let second = app.oneshot(get_request("/api/sessions/abc")).await.unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(second.headers()[RETRY_AFTER], "30");
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_are_retried_through_the_pipeline() {
    let store = Arc::new(FlakyStore::failing(2, errors::transient()));
    store
        .inner()
        .insert("sessions", "s1", json!({ "title": "Leg day" }))
        .await
        .unwrap();
    let state = AppState::with_store(ApiConfig::default(), store.clone() as Arc<dyn DataStore>);

    let response = app(state.clone())
        .oneshot(get_request("/api/sessions/s1"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(store.calls(), 3);
    assert!(!state.availability().is_temporarily_unavailable());
    let body = json_body(response).await;
    assert_eq!(body["data"]["title"], "Leg day");
}

// ============================================================================
// URL INPUT
// ============================================================================

#[tokio::test]
async fn test_path_param_is_sanitised() {
    let app = app(AppState::in_memory(ApiConfig::default()));
    // "  Тест\u{0008} "
    let response = app
        .oneshot(get_request(
            "/api/exercises/%20%20%D0%A2%D0%B5%D1%81%D1%82%08%20",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["slug"], "Тест");
}

#[tokio::test]
async fn test_forbidden_param_is_rejected() {
    let app = app(AppState::in_memory(ApiConfig::default()));
    let response = app
        .oneshot(get_request("/api/exercises/bad%3Cvalue%3E"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert_error_envelope(&body, "invalid_url_input");
    assert_eq!(body["error"]["resource"], "params.slug");
    assert_eq!(body["error"]["details"]["code"], "value_contains_forbidden_symbols");
}

#[tokio::test]
async fn test_repeated_query_key_reports_index() {
    let app = app(AppState::in_memory(ApiConfig::default()));
    let response = app
        .oneshot(get_request("/api/exercises/squat?tag=legs&tag=%7Bbad%7D"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = json_body(response).await;
    assert_eq!(body["error"]["resource"], "query.tag[1]");
}

#[tokio::test]
async fn test_query_value_is_sanitised() {
    let app = app(AppState::in_memory(ApiConfig::default()));
    let response = app
        .oneshot(get_request("/api/exercises/squat?tag=%20%EF%BC%A1%EF%BC%A2%20"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["slug"], "squat");
    assert_eq!(body["tag"], "AB");
}

// ============================================================================
// PERFORMANCE SAMPLING
// ============================================================================

#[tokio::test]
async fn test_matched_requests_are_sampled() {
    let state = AppState::in_memory(ApiConfig::default());
    let app = app(state.clone());

    let ok = app.clone().oneshot(get_request("/api/exercises/squat")).await.unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    let missing = app.oneshot(get_request("/api/nowhere")).await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let snapshot = state.analytics.performance.snapshot();
    assert_eq!(snapshot.totals.requests, 1);
    assert_eq!(snapshot.totals.responses, 1);
    assert_eq!(snapshot.totals.in_flight, 0);
}
