/// Execution REST API endpoints
///
/// Mock start, production routing and resume of compiled flows, plus the
/// captured logs and run records those dispatches leave behind.

use crate::{
    api::AppState,
    error::DispatchError,
    runtime::{program::ProductionEvent, DispatchRequest, FlowResponse, RunRecord},
};
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

const DEFAULT_RUN_LIMIT: usize = 50;

/// Request body for the production router
#[derive(Debug, Deserialize)]
pub struct RouteRequest {
    pub node_setup_version_id: String,
    pub tenant_id: String,
    pub project_id: String,
    #[serde(default = "default_stage")]
    pub stage: String,
    /// Path parameters matched by the caller's route table
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

fn default_stage() -> String {
    "production".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

impl RouteRequest {
    fn validate(&self) -> Result<(), DispatchError> {
        for (label, id) in [
            ("node_setup_version_id", &self.node_setup_version_id),
            ("tenant_id", &self.tenant_id),
            ("project_id", &self.project_id),
        ] {
            if Uuid::parse_str(id).is_err() {
                return Err(DispatchError::InvalidIdentifier(format!("{} '{}'", label, id)));
            }
        }
        Ok(())
    }

    /// Event handed to the program's production entry
    fn into_event(self) -> ProductionEvent {
        let cookies = self
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("cookie"))
            .map(|(_, value)| {
                value
                    .split(';')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let path_parameters = self
            .variables
            .into_iter()
            .map(|(name, value)| match value {
                Value::String(s) => (name, s),
                other => (name, other.to_string()),
            })
            .collect();

        ProductionEvent {
            http_method: self.method.to_uppercase(),
            raw_path: self.path,
            headers: self.headers,
            body: self.body,
            query_string_parameters: self.query_params,
            path_parameters,
            cookies,
            execution_type: None,
        }
    }
}

/// Request body for resuming a paused run
#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub run_id: String,
    pub resume_node_id: String,
    #[serde(default)]
    pub user_input: Value,
}

#[derive(Debug, Deserialize)]
pub struct MockQuery {
    pub sub_stage: Option<String>,
    pub tenant_id: Option<String>,
    pub project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub after: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    pub limit: Option<usize>,
}

/// Create execution routes
pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/execution/route/", post(route_request))
        .route("/execution/{version}/resume/", post(resume_run))
        .route("/execution/{version}/mock/{node_id}/", get(mock_start))
        .route("/execution/{version}/logs/", get(get_logs).delete(clear_logs))
        .route("/runs/", get(list_runs))
        .route("/runs/{run_id}/", get(get_run))
}

/// Route a production request into its flow version
///
/// POST /execution/route/
/// Returns the flow's own status, headers and body.
async fn route_request(
    State(state): State<AppState>,
    Json(payload): Json<RouteRequest>,
) -> Result<FlowResponse, DispatchError> {
    payload.validate()?;

    let project = state
        .projects
        .get(&payload.tenant_id, &payload.project_id)
        .await
        .ok_or_else(|| DispatchError::NotFound("Project".to_string()))?;

    let version = payload.node_setup_version_id.clone();
    let stage = payload.stage.clone();
    tracing::info!("📥 {} {} -> {} ({})", payload.method, payload.path, version, stage);

    let request = DispatchRequest::production_start(&version, &stage, payload.into_event())
        .with_project(&project.tenant_id, &project.id);

    Ok(state.dispatcher.dispatch(request).await.response)
}

/// Resume a paused run from a given node
///
/// POST /execution/{version}/resume/
/// Body: { "run_id": "...", "resume_node_id": "...", "user_input": {...} }
async fn resume_run(
    State(state): State<AppState>,
    Path(version): Path<String>,
    Json(payload): Json<ResumeRequest>,
) -> FlowResponse {
    let request = DispatchRequest::resume(&version, &payload.run_id, &payload.resume_node_id, payload.user_input);
    state.dispatcher.dispatch(request).await.response
}

/// Debug-run a single node of a flow version
///
/// GET /execution/{version}/mock/{node_id}/?sub_stage=mock
async fn mock_start(
    State(state): State<AppState>,
    Path((version, node_id)): Path<(String, String)>,
    Query(query): Query<MockQuery>,
) -> FlowResponse {
    let sub_stage = query.sub_stage.as_deref().unwrap_or("mock");
    let mut request = DispatchRequest::mock_start(&version, Some(&node_id), Some(sub_stage));
    if let (Some(tenant), Some(project)) = (&query.tenant_id, &query.project_id) {
        request = request.with_project(tenant, project);
    }

    state.dispatcher.dispatch(request).await.response
}

/// Captured log lines of every variant of a flow version
///
/// GET /execution/{version}/logs/?after=<ms>
async fn get_logs(
    State(state): State<AppState>,
    Path(version): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Json<Value> {
    let logs = state.logs.read_source(&version, query.after);
    Json(json!({ "logs": logs }))
}

/// DELETE /execution/{version}/logs/
async fn clear_logs(State(state): State<AppState>, Path(version): Path<String>) -> Json<Value> {
    let cleared = state.logs.clear_source(&version);
    tracing::info!("🧹 Cleared {} log lines of {}", cleared, version);

    Json(json!({
        "message": "Logs cleared",
        "cleared": cleared,
    }))
}

/// GET /runs/{run_id}/
async fn get_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Result<Json<RunRecord>, DispatchError> {
    state
        .runs
        .get(&run_id)
        .map(Json)
        .ok_or_else(|| DispatchError::NotFound(format!("Run '{}'", run_id)))
}

/// GET /runs/?limit=<n>
async fn list_runs(State(state): State<AppState>, Query(query): Query<RunsQuery>) -> Json<Value> {
    let runs = state.runs.recent(query.limit.unwrap_or(DEFAULT_RUN_LIMIT));
    Json(json!({ "runs": runs }))
}
