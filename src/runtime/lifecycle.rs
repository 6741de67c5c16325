/// Run lifecycle tracking
///
/// Allocates run ids, records start and terminal timestamps and turns a
/// finished run's report into the response handed back to the caller.

use crate::error::DispatchError;
use crate::runtime::program::ExecutionFlowReport;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

const DEFAULT_RUN_CAPACITY: usize = 1024;
const RESPONSE_NODE_PREFIX: &str = "HttpResponse";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    MockStart,
    ProductionStart,
    Resume,
    ScheduleFire,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MockStart => "mock_start",
            Self::ProductionStart => "production_start",
            Self::Resume => "resume",
            Self::ScheduleFire => "schedule_fire",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Portion of the graph a run executes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "node_id", rename_all = "snake_case")]
pub enum RunScope {
    FullGraph,
    SingleNode(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub flow_version_id: String,
    pub stage: String,
    pub sub_stage: Option<String>,
    pub trigger_kind: TriggerKind,
    pub scope: RunScope,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub resumed_from: Option<String>,
    pub failure: Option<String>,
}

/// What the dispatcher keeps while a run is in flight
#[derive(Debug, Clone, PartialEq)]
pub struct RunHandle {
    pub run_id: String,
    pub trigger_kind: TriggerKind,
    pub scope: RunScope,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    runs: HashMap<String, RunRecord>,
    order: VecDeque<String>,
}

/// Bounded record of recent runs
#[derive(Debug)]
pub struct RunTracker {
    capacity: usize,
    inner: Mutex<TrackerInner>,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RUN_CAPACITY)
    }
}

impl RunTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(TrackerInner::default()),
        }
    }

    pub fn start_run(
        &self,
        flow_version_id: &str,
        stage: &str,
        sub_stage: Option<&str>,
        trigger_kind: TriggerKind,
        node_id: Option<&str>,
    ) -> RunHandle {
        let scope = match (trigger_kind, node_id) {
            (TriggerKind::MockStart, Some(node_id)) => RunScope::SingleNode(node_id.to_string()),
            _ => RunScope::FullGraph,
        };
        self.insert(flow_version_id, stage, sub_stage, trigger_kind, scope, None)
    }

    /// New attempt continuing `prior_run_id`
    pub fn start_resumed_run(
        &self,
        flow_version_id: &str,
        stage: &str,
        sub_stage: Option<&str>,
        prior_run_id: &str,
    ) -> RunHandle {
        self.insert(
            flow_version_id,
            stage,
            sub_stage,
            TriggerKind::Resume,
            RunScope::FullGraph,
            Some(prior_run_id.to_string()),
        )
    }

    pub fn complete(&self, run_id: &str) -> bool {
        self.finish(run_id, RunStatus::Completed, None)
    }

    pub fn fail(&self, run_id: &str, reason: &str) -> bool {
        self.finish(run_id, RunStatus::Failed, Some(reason.to_string()))
    }

    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.lock().runs.get(run_id).cloned()
    }

    /// Most recent runs first
    pub fn recent(&self, limit: usize) -> Vec<RunRecord> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .rev()
            .filter_map(|run_id| inner.runs.get(run_id))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(
        &self,
        flow_version_id: &str,
        stage: &str,
        sub_stage: Option<&str>,
        trigger_kind: TriggerKind,
        scope: RunScope,
        resumed_from: Option<String>,
    ) -> RunHandle {
        let handle = RunHandle {
            run_id: Uuid::new_v4().to_string(),
            trigger_kind,
            scope: scope.clone(),
            started_at: Utc::now(),
        };

        let record = RunRecord {
            run_id: handle.run_id.clone(),
            flow_version_id: flow_version_id.to_string(),
            stage: stage.to_string(),
            sub_stage: sub_stage.map(str::to_string),
            trigger_kind,
            scope,
            status: RunStatus::Running,
            started_at: handle.started_at,
            finished_at: None,
            resumed_from,
            failure: None,
        };

        let mut inner = self.lock();
        inner.order.push_back(handle.run_id.clone());
        inner.runs.insert(handle.run_id.clone(), record);
        self.evict(&mut inner);

        handle
    }

    fn finish(&self, run_id: &str, status: RunStatus, failure: Option<String>) -> bool {
        let mut inner = self.lock();
        let Some(record) = inner.runs.get_mut(run_id) else {
            tracing::warn!("⚠️ Cannot mark unknown run {} as {}", run_id, status);
            return false;
        };

        if record.status.is_terminal() {
            tracing::warn!(
                "⚠️ Rejected transition of run {} from {} to {}",
                run_id,
                record.status,
                status
            );
            return false;
        }

        record.status = status;
        record.finished_at = Some(Utc::now());
        record.failure = failure;
        true
    }

    /// Drop the oldest terminal runs until the tracker fits its capacity
    fn evict(&self, inner: &mut TrackerInner) {
        while inner.runs.len() > self.capacity {
            let position = inner.order.iter().position(|run_id| {
                inner
                    .runs
                    .get(run_id)
                    .map_or(true, |record| record.status.is_terminal())
            });

            match position.and_then(|index| inner.order.remove(index)) {
                Some(run_id) => {
                    inner.runs.remove(&run_id);
                }
                None => break,
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// HTTP-like response produced by a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl FlowResponse {
    pub fn json(status: u16, value: &Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        Self {
            status,
            headers,
            body: value.to_string(),
        }
    }

    /// Response of a scheduled run without a response node
    pub fn schedule_success() -> Self {
        Self::json(200, &json!({"message": "Schedule executed successfully"}))
    }

    pub fn from_error(err: &DispatchError) -> Self {
        Self::json(err.status().as_u16(), &err.to_body())
    }

    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_str(&self.body).ok()
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for FlowResponse {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = (status, self.body).into_response();
        let headers = response.headers_mut();

        // insert() replaces the text/plain default when the flow sets its own.
        for (name, value) in &self.headers {
            match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => tracing::warn!("⚠️ Dropping invalid response header: {}", name),
            }
        }

        response
    }
}

/// Map the `response` value of a response node into a `FlowResponse`
pub fn response_from_value(value: &Value) -> FlowResponse {
    let Value::Object(map) = value else {
        return FlowResponse::json(200, value);
    };

    let status = map
        .get("status")
        .filter(|v| !v.is_null())
        .or_else(|| map.get("statusCode"))
        .and_then(status_from_value)
        .unwrap_or(200);

    let headers = map
        .get("headers")
        .and_then(Value::as_object)
        .map(|headers| {
            headers
                .iter()
                .map(|(name, value)| {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (name.clone(), value)
                })
                .collect()
        })
        .unwrap_or_default();

    let body = match map.get("body") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };

    FlowResponse { status, headers, body }
}

fn status_from_value(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Response of the last `HttpResponse*` node the run visited
pub fn extract_terminal_response(
    report: &ExecutionFlowReport,
    trigger_kind: TriggerKind,
) -> Result<FlowResponse, DispatchError> {
    let terminal = report
        .nodes_order
        .iter()
        .rev()
        .find(|node| node.node_type.starts_with(RESPONSE_NODE_PREFIX));

    match terminal {
        Some(node) => Ok(node
            .response
            .as_ref()
            .map(response_from_value)
            .unwrap_or_else(|| response_from_value(&Value::Object(Default::default())))),
        None if trigger_kind == TriggerKind::ScheduleFire || report.is_schedule => {
            Ok(FlowResponse::schedule_success())
        }
        None => Err(DispatchError::runtime("No valid HttpResponse node found")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::program::ExecutedNode;
    use axum::http::header;

    fn report(nodes: Vec<ExecutedNode>) -> ExecutionFlowReport {
        ExecutionFlowReport {
            run_id: "r1".into(),
            nodes_order: nodes,
            is_schedule: false,
        }
    }

    #[test]
    fn last_response_node_wins() {
        let report = report(vec![
            ExecutedNode::new("a", "HttpResponseA").with_response(json!({"status": 201, "body": "first"})),
            ExecutedNode::new("mid", "Transform"),
            ExecutedNode::new("b", "HttpResponseB").with_response(json!({"statusCode": 202, "body": "second"})),
        ]);

        let response = extract_terminal_response(&report, TriggerKind::ProductionStart).unwrap();
        assert_eq!(response.status, 202);
        assert_eq!(response.body, "second");
    }

    #[test]
    fn mapping_defaults_and_json_bodies() {
        let response = response_from_value(&json!({
            "headers": {"X-Retry": 3},
            "body": {"ok": true}
        }));
        assert_eq!(response.status, 200);
        assert_eq!(response.headers.get("X-Retry").map(String::as_str), Some("3"));
        assert_eq!(response.body_json(), Some(json!({"ok": true})));

        let empty = response_from_value(&json!({"status": "404"}));
        assert_eq!(empty.status, 404);
        assert_eq!(empty.body, "");
        assert!(empty.headers.is_empty());
    }

    #[test]
    fn non_mapping_response_becomes_json() {
        let response = response_from_value(&json!(["a", "b"]));
        assert_eq!(response.status, 200);
        assert_eq!(response.headers["Content-Type"], "application/json");
        assert_eq!(response.body, r#"["a","b"]"#);
    }

    #[test]
    fn schedule_without_response_node_gets_sentinel() {
        let report = report(vec![ExecutedNode::new("n1", "Transform")]);
        let response = extract_terminal_response(&report, TriggerKind::ScheduleFire).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body_json(), Some(json!({"message": "Schedule executed successfully"})));
    }

    #[test]
    fn production_without_response_node_fails() {
        let report = report(vec![ExecutedNode::new("n1", "Transform")]);
        let err = extract_terminal_response(&report, TriggerKind::ProductionStart).unwrap_err();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "No valid HttpResponse node found");
    }

    #[test]
    fn terminal_runs_are_final() {
        let tracker = RunTracker::default();
        let handle = tracker.start_run("v1", "mock", None, TriggerKind::MockStart, Some("n1"));
        assert_eq!(handle.scope, RunScope::SingleNode("n1".into()));

        assert!(tracker.complete(&handle.run_id));
        assert!(!tracker.fail(&handle.run_id, "late failure"));

        let record = tracker.get(&handle.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert!(record.finished_at.is_some());
        assert!(record.failure.is_none());
    }

    #[test]
    fn resumed_runs_remember_their_origin() {
        let tracker = RunTracker::default();
        let handle = tracker.start_resumed_run("v1", "mock", None, "prior-run");
        let record = tracker.get(&handle.run_id).unwrap();
        assert_eq!(record.trigger_kind, TriggerKind::Resume);
        assert_eq!(record.resumed_from.as_deref(), Some("prior-run"));
        assert_ne!(handle.run_id, "prior-run");
    }

    #[test]
    fn oldest_terminal_runs_are_evicted_first() {
        let tracker = RunTracker::new(2);
        let running = tracker.start_run("v1", "production", None, TriggerKind::ProductionStart, None);
        let done = tracker.start_run("v1", "production", None, TriggerKind::ProductionStart, None);
        tracker.complete(&done.run_id);
        let newest = tracker.start_run("v1", "production", None, TriggerKind::ProductionStart, None);

        assert!(tracker.get(&running.run_id).is_some());
        assert!(tracker.get(&done.run_id).is_none());
        assert!(tracker.get(&newest.run_id).is_some());

        let recent: Vec<_> = tracker.recent(10).into_iter().map(|r| r.run_id).collect();
        assert_eq!(recent, vec![newest.run_id, running.run_id]);
    }

    #[test]
    fn flow_response_keeps_custom_content_type() {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/html".to_string());
        let response = FlowResponse {
            status: 201,
            headers,
            body: "<p>hi</p>".into(),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html");
    }
}
