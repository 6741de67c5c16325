/// Listener activation endpoints
///
/// A UI watching a flow version registers here; while registered, test
/// traffic for that version emits run start/end events.

use crate::api::AppState;
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

const DEFAULT_LISTENER_STAGE: &str = "mock";

#[derive(Debug, Deserialize)]
pub struct ActivateQuery {
    pub stage: Option<String>,
}

/// Create listener routes
pub fn create_listener_routes() -> Router<AppState> {
    Router::new()
        .route("/listeners/", get(list_listeners))
        .route("/listeners/{version}/", get(listener_status))
        .route("/listeners/{version}/activate/", post(activate_listener))
        .route("/listeners/{version}/deactivate/", post(deactivate_listener))
}

/// GET /listeners/{version}/
async fn listener_status(State(state): State<AppState>, Path(version): Path<String>) -> Json<Value> {
    let is_active = state
        .listeners
        .has_listener(&version, Some(DEFAULT_LISTENER_STAGE), false);
    Json(json!({ "is_active": is_active }))
}

/// POST /listeners/{version}/activate/?stage=mock
async fn activate_listener(
    State(state): State<AppState>,
    Path(version): Path<String>,
    Query(query): Query<ActivateQuery>,
) -> Json<Value> {
    let stage = query.stage.as_deref().unwrap_or(DEFAULT_LISTENER_STAGE);
    state.listeners.activate(&version, Some(stage));
    tracing::info!("👂 Listener activated for {} ({})", version, stage);

    Json(json!({ "message": "Listener activated." }))
}

/// POST /listeners/{version}/deactivate/
async fn deactivate_listener(State(state): State<AppState>, Path(version): Path<String>) -> Json<Value> {
    if state.listeners.deactivate(&version) {
        tracing::info!("🔇 Listener deactivated for {}", version);
    }

    Json(json!({ "message": "Listener deactivated." }))
}

/// GET /listeners/
async fn list_listeners(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "listeners": state.listeners.active_versions() }))
}

#[cfg(test)]
mod tests {
    use crate::api::{build_router, test_support};
    use crate::project::InMemoryProjectCatalog;
    use crate::runtime::ProgramRegistry;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    async fn call(app: &Router, method: Method, uri: &str) -> Value {
        let resp = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn activate_then_deactivate() {
        let state = test_support::state(ProgramRegistry::new(), InMemoryProjectCatalog::new()).await;
        let app = build_router(state);

        assert_eq!(call(&app, Method::GET, "/listeners/v1/").await, json!({"is_active": false}));

        let body = call(&app, Method::POST, "/listeners/v1/activate/").await;
        assert_eq!(body["message"], "Listener activated.");
        assert_eq!(call(&app, Method::GET, "/listeners/v1/").await, json!({"is_active": true}));
        assert_eq!(call(&app, Method::GET, "/listeners/").await["listeners"], json!(["v1"]));

        let body = call(&app, Method::POST, "/listeners/v1/deactivate/").await;
        assert_eq!(body["message"], "Listener deactivated.");
        assert_eq!(call(&app, Method::GET, "/listeners/v1/").await, json!({"is_active": false}));
    }

    #[tokio::test]
    async fn status_only_reports_mock_stage_listeners() {
        let state = test_support::state(ProgramRegistry::new(), InMemoryProjectCatalog::new()).await;
        let app = build_router(state);

        call(&app, Method::POST, "/listeners/v2/activate/?stage=test").await;
        assert_eq!(call(&app, Method::GET, "/listeners/v2/").await, json!({"is_active": false}));
        assert_eq!(call(&app, Method::GET, "/listeners/").await["listeners"], json!(["v2"]));
    }
}
