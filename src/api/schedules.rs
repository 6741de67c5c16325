/// Schedule publishing REST API endpoints
///
/// Publishing persists the schedule and hot-swaps its cron job without
/// restarting the scheduler.

use crate::{api::AppState, schedule::ScheduleJob};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get},
    Router,
};
use serde::Serialize;
use serde_json::{json, Value};

/// Response for publish/unpublish operations
#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    pub id: String,
    pub message: String,
}

/// Create schedule routes
pub fn create_schedule_routes() -> Router<AppState> {
    Router::new()
        .route("/schedules/", get(list_schedules).post(publish_schedule))
        .route("/schedules/{id}/", delete(unpublish_schedule))
}

/// Publish (add or update) a schedule
///
/// POST /schedules/
/// Body: { "id": "...", "name": "...", "cron_expression": "0 3 * * *", "flow_version_id": "..." }
async fn publish_schedule(
    State(state): State<AppState>,
    Json(job): Json<ScheduleJob>,
) -> Result<Json<ScheduleResponse>, StatusCode> {
    if job.id.is_empty() || job.flow_version_id.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    if let Err(e) = job.cron_schedule() {
        tracing::warn!("⚠️ Rejected schedule {}: {:#}", job.id, e);
        return Err(StatusCode::BAD_REQUEST);
    }

    let id = job.id.clone();
    let name = job.name.clone();
    if let Err(e) = state.scheduler.publish(job).await {
        tracing::error!("Failed to publish schedule {}: {:#}", id, e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    tracing::info!("🔥 Published schedule: {} ({})", id, name);

    Ok(Json(ScheduleResponse {
        message: format!("Schedule '{}' published", name),
        id,
    }))
}

/// Unpublish a schedule
///
/// DELETE /schedules/{id}/
async fn unpublish_schedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ScheduleResponse>, StatusCode> {
    match state.scheduler.unpublish(&id).await {
        Ok(true) => {
            tracing::info!("🗑️ Unpublished schedule: {}", id);
            Ok(Json(ScheduleResponse {
                message: format!("Schedule '{}' unpublished", id),
                id,
            }))
        }
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to unpublish schedule {}: {:#}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// List scheduled jobs with their next fire time
///
/// GET /schedules/
async fn list_schedules(State(state): State<AppState>) -> Json<Value> {
    let schedules = state.scheduler.list_active_jobs().await;
    Json(json!({ "schedules": schedules }))
}
