/// Remote serverless execution
///
/// In remote mode the dispatcher serializes the trigger into an invocation
/// payload and hands it to a `RemoteExecutor`. `HttpRemoteExecutor` posts it to
/// `{base_url}/functions/{function_name}/invocations`.

use crate::error::DispatchError;
use crate::runtime::dispatcher::{DispatchRequest, Trigger};
use crate::runtime::lifecycle::{extract_terminal_response, response_from_value, FlowResponse, TriggerKind};
use crate::runtime::program::ExecutionFlowReport;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteInvocation {
    pub function_name: String,
    pub payload: Value,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote executor unreachable: {0}")]
    Transport(String),

    #[error("remote executor returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("remote executor returned an unreadable payload: {0}")]
    InvalidPayload(String),

    #[error("remote function failed: {message}")]
    Function { message: String },
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn invoke(&self, invocation: RemoteInvocation) -> Result<Value, RemoteError>;
}

/// reqwest-backed executor client
#[derive(Debug, Clone)]
pub struct HttpRemoteExecutor {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteExecutor {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn invocation_url(&self, function_name: &str) -> String {
        format!("{}/functions/{}/invocations", self.base_url, function_name)
    }
}

#[async_trait]
impl RemoteExecutor for HttpRemoteExecutor {
    async fn invoke(&self, invocation: RemoteInvocation) -> Result<Value, RemoteError> {
        let url = self.invocation_url(&invocation.function_name);
        tracing::debug!("🌐 POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(&invocation.payload)
            .send()
            .await
            .map_err(|e| RemoteError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidPayload(e.to_string()))?;

        if let Some(message) = value.get("errorMessage").and_then(Value::as_str) {
            return Err(RemoteError::Function {
                message: message.to_string(),
            });
        }

        Ok(value)
    }
}

/// `node_setup_{version}_{variant}`
pub fn remote_function_name(flow_version_id: &str, variant: &str) -> String {
    format!("node_setup_{}_{}", flow_version_id, variant)
}

/// Deployment variant a trigger runs against
pub fn remote_variant(request: &DispatchRequest) -> &'static str {
    match &request.trigger {
        Trigger::MockStart { .. } | Trigger::Resume { .. } => "mock",
        Trigger::ProductionStart { .. } if request.is_test_traffic() => "mock",
        _ => "published",
    }
}

/// Serialize a trigger into the executor's payload
pub fn build_invocation(request: &DispatchRequest, run_id: &str) -> RemoteInvocation {
    let function_name = remote_function_name(&request.flow_version_id, remote_variant(request));

    let mut payload = match &request.trigger {
        Trigger::MockStart { node_id } => json!({
            "node_id": node_id,
            "run_id": run_id,
            "mock": true,
            "sub_stage": request.sub_stage,
        }),
        Trigger::ProductionStart { event } => json!({
            "event": event,
            "run_id": run_id,
            "stage": request.stage,
        }),
        Trigger::Resume { run_id: prior_run_id, resume_node_id, user_input } => json!({
            "resume": true,
            "run_id": prior_run_id,
            "resume_node_id": resume_node_id,
            "user_input": user_input,
        }),
        Trigger::ScheduleFire { schedule_id } => json!({
            "schedule_id": schedule_id,
            "run_id": run_id,
            "execution_type": "schedule",
        }),
    };

    if let (Some(tenant), Some(project)) = (&request.tenant_id, &request.project_id) {
        payload["artifact_key"] = Value::String(format!("{}/{}/{}.py", tenant, project, function_name));
    }

    RemoteInvocation { function_name, payload }
}

/// Normalize a remote result into the same shape local runs produce
pub fn map_remote_response(trigger_kind: TriggerKind, value: Value) -> Result<FlowResponse, DispatchError> {
    match trigger_kind {
        TriggerKind::MockStart => Ok(FlowResponse::json(200, &json!({"status": "mock executed", "result": value}))),
        TriggerKind::Resume => Ok(FlowResponse::json(200, &json!({"status": "resumed", "result": value}))),
        TriggerKind::ProductionStart | TriggerKind::ScheduleFire => {
            if let Ok(report) = serde_json::from_value::<ExecutionFlowReport>(value.clone()) {
                return extract_terminal_response(&report, trigger_kind);
            }
            if value.is_null() && trigger_kind == TriggerKind::ScheduleFire {
                return Ok(FlowResponse::schedule_success());
            }
            Ok(response_from_value(&value))
        }
    }
}
