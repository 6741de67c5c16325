/// HTTP API Layer
///
/// This module provides the REST endpoints of the coordinator:
/// - Mock start, production routing and resume of compiled flows
/// - Captured log retrieval and clearing
/// - Listener activation for live observers
/// - Schedule publishing

use crate::{
    listeners::ListenerRegistry,
    logs::LogStore,
    project::ProjectCatalog,
    runtime::{CronSchedulerService, Dispatcher, RunTracker},
};
use axum::{routing::get, Router};
use std::sync::Arc;

// Execution triggers, logs and run records
pub mod execution;

// Listener activation endpoints
pub mod listeners;

// Schedule publishing endpoints
pub mod schedules;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub logs: Arc<LogStore>,
    pub listeners: Arc<ListenerRegistry>,
    pub runs: Arc<RunTracker>,
    pub scheduler: Arc<CronSchedulerService>,
    pub projects: Arc<dyn ProjectCatalog>,
}

/// Assemble every route of the service
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .merge(execution::create_execution_routes())
        .merge(listeners::create_listener_routes())
        .merge(schedules::create_schedule_routes())
        .with_state(state)
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::InMemoryProjectCatalog;
    use crate::runtime::ProgramRegistry;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn healthz_answers_ok() {
        let state = test_support::state(ProgramRegistry::new(), InMemoryProjectCatalog::new()).await;
        let resp = build_router(state)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }
}
