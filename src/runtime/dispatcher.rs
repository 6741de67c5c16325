/// Execution dispatcher
///
/// Every trigger (mock start, production request, resume, cron fire) goes
/// through `Dispatcher::dispatch`: it records the run, opens a capture scope,
/// notifies live observers, runs the program locally or remotely and turns the
/// result into one `FlowResponse` shape.

use crate::config::ExecutionMode;
use crate::error::DispatchError;
use crate::listeners::{FlowEvent, FlowEventKind, FlowNotifier, ListenerRegistry, NoopNotifier};
use crate::logs::{Console, ExecutionKey, LogStore, ScopedCapture};
use crate::project::{EnvSecretResolver, SecretResolver};
use crate::runtime::lifecycle::{
    extract_terminal_response, FlowResponse, RunHandle, RunStatus, RunTracker, TriggerKind,
};
use crate::runtime::program::{
    CompiledProgram, EntryArgs, EntryCall, EntryPoint, ExecutionFlowReport, ProductionEvent, ProgramError,
    MOCK_START_ENTRY, PRODUCTION_START_ENTRY, RESUME_ENTRY, SCHEDULE_ENTRY_FALLBACKS,
};
use crate::runtime::registry::ProgramRegistry;
use crate::runtime::remote::{self, RemoteExecutor};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const MOCK_STAGE: &str = "mock";
const TEST_STAGES: [&str; 2] = ["mock", "test"];

/// What started the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    MockStart {
        node_id: Option<String>,
    },
    ProductionStart {
        event: ProductionEvent,
    },
    Resume {
        run_id: String,
        resume_node_id: String,
        user_input: Value,
    },
    ScheduleFire {
        schedule_id: String,
    },
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Self::MockStart { .. } => TriggerKind::MockStart,
            Self::ProductionStart { .. } => TriggerKind::ProductionStart,
            Self::Resume { .. } => TriggerKind::Resume,
            Self::ScheduleFire { .. } => TriggerKind::ScheduleFire,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub trigger: Trigger,
    pub flow_version_id: String,
    pub stage: String,
    pub sub_stage: Option<String>,
    pub tenant_id: Option<String>,
    pub project_id: Option<String>,
}

impl DispatchRequest {
    fn new(trigger: Trigger, flow_version_id: &str, stage: &str, sub_stage: Option<&str>) -> Self {
        Self {
            trigger,
            flow_version_id: flow_version_id.to_string(),
            stage: stage.to_string(),
            sub_stage: sub_stage.map(str::to_string),
            tenant_id: None,
            project_id: None,
        }
    }

    /// Debug run, restricted to `node_id` when given
    pub fn mock_start(flow_version_id: &str, node_id: Option<&str>, sub_stage: Option<&str>) -> Self {
        let trigger = Trigger::MockStart {
            node_id: node_id.map(str::to_string),
        };
        Self::new(trigger, flow_version_id, MOCK_STAGE, sub_stage)
    }

    pub fn production_start(flow_version_id: &str, stage: &str, event: ProductionEvent) -> Self {
        Self::new(Trigger::ProductionStart { event }, flow_version_id, stage, None)
    }

    pub fn resume(flow_version_id: &str, run_id: &str, resume_node_id: &str, user_input: Value) -> Self {
        let trigger = Trigger::Resume {
            run_id: run_id.to_string(),
            resume_node_id: resume_node_id.to_string(),
            user_input,
        };
        Self::new(trigger, flow_version_id, MOCK_STAGE, None)
    }

    pub fn schedule_fire(flow_version_id: &str, schedule_id: &str) -> Self {
        let trigger = Trigger::ScheduleFire {
            schedule_id: schedule_id.to_string(),
        };
        Self::new(trigger, flow_version_id, "schedule", Some("local"))
    }

    pub fn with_project(mut self, tenant_id: &str, project_id: &str) -> Self {
        self.tenant_id = Some(tenant_id.to_string());
        self.project_id = Some(project_id.to_string());
        self
    }

    /// Log stream the run's output is captured into
    pub fn execution_key(&self) -> ExecutionKey {
        match &self.trigger {
            Trigger::MockStart { .. } => ExecutionKey::new(&self.flow_version_id, "mock"),
            Trigger::Resume { .. } => ExecutionKey::new(&self.flow_version_id, "resume"),
            Trigger::ProductionStart { .. } => ExecutionKey::new(&self.flow_version_id, &self.stage),
            Trigger::ScheduleFire { schedule_id } => ExecutionKey::schedule(schedule_id),
        }
    }

    /// Traffic observers may be watching
    pub fn is_test_traffic(&self) -> bool {
        match &self.trigger {
            Trigger::MockStart { .. } => true,
            Trigger::ProductionStart { .. } => TEST_STAGES.contains(&self.stage.as_str()),
            _ => false,
        }
    }

    fn node_id(&self) -> Option<&str> {
        match &self.trigger {
            Trigger::MockStart { node_id } => node_id.as_deref(),
            _ => None,
        }
    }

    fn start_line(&self, run_id: &str) -> String {
        match &self.trigger {
            Trigger::Resume { run_id: prior, .. } => {
                format!("RESUME START RequestId: {} Version: {}", prior, self.flow_version_id)
            }
            Trigger::ScheduleFire { schedule_id } => {
                format!("START Schedule execution - RequestId: {} Schedule: {}", run_id, schedule_id)
            }
            _ => format!("START RequestId: local-{} Version: {}", run_id, self.flow_version_id),
        }
    }

    fn end_line(&self, run_id: &str) -> String {
        match &self.trigger {
            Trigger::Resume { run_id: prior, .. } => format!("RESUME END RequestId: {}", prior),
            Trigger::ScheduleFire { .. } => format!("END Schedule execution - RequestId: {}", run_id),
            _ => format!("END RequestId: local-{}", run_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub response: FlowResponse,
}

pub struct Dispatcher {
    mode: ExecutionMode,
    remote_timeout: Duration,
    programs: Arc<ProgramRegistry>,
    runs: Arc<RunTracker>,
    logs: Arc<LogStore>,
    listeners: Arc<ListenerRegistry>,
    notifier: Arc<dyn FlowNotifier>,
    remote: Option<Arc<dyn RemoteExecutor>>,
    secrets: Arc<dyn SecretResolver>,
}

impl Dispatcher {
    pub fn new(
        mode: ExecutionMode,
        programs: Arc<ProgramRegistry>,
        runs: Arc<RunTracker>,
        logs: Arc<LogStore>,
        listeners: Arc<ListenerRegistry>,
    ) -> Self {
        Self {
            mode,
            remote_timeout: Duration::from_secs(910),
            programs,
            runs,
            logs,
            listeners,
            notifier: Arc::new(NoopNotifier),
            remote: None,
            secrets: Arc::new(EnvSecretResolver),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn FlowNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_remote(mut self, remote: Arc<dyn RemoteExecutor>, timeout: Duration) -> Self {
        self.remote = Some(remote);
        self.remote_timeout = timeout;
        self
    }

    pub fn with_secrets(mut self, secrets: Arc<dyn SecretResolver>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn runs(&self) -> &Arc<RunTracker> {
        &self.runs
    }

    /// Run one trigger to completion
    pub async fn dispatch(&self, request: DispatchRequest) -> DispatchOutcome {
        let kind = request.trigger.kind();
        let version = request.flow_version_id.as_str();

        // Editor-driven triggers register the version's mock listener.
        if matches!(request.trigger, Trigger::MockStart { .. } | Trigger::Resume { .. }) {
            self.listeners.activate(version, Some(MOCK_STAGE));
        }

        let handle = match &request.trigger {
            Trigger::Resume { run_id, .. } => self
                .runs
                .start_resumed_run(version, &request.stage, request.sub_stage.as_deref(), run_id),
            _ => self.runs.start_run(
                version,
                &request.stage,
                request.sub_stage.as_deref(),
                kind,
                request.node_id(),
            ),
        };

        tracing::info!(
            "🚀 Dispatching {} run {} for version {} ({:?})",
            kind,
            handle.run_id,
            version,
            self.mode
        );

        let capture = self.logs.begin_capture(request.execution_key());
        capture.add_line(request.start_line(&handle.run_id));

        let observed = request.is_test_traffic();
        if observed && self.listeners.has_listener(version, Some(&request.stage), true) {
            self.notifier.notify(FlowEvent::new(
                FlowEventKind::RunStart,
                version,
                &handle.run_id,
                request.node_id(),
            ));
            capture.add_line("Sent run_start event to listeners");
        }

        let result = match self.mode {
            ExecutionMode::Local => self.run_local(&request, &handle, &capture).await,
            ExecutionMode::Remote => self.run_remote(&request, &handle).await,
        };

        if observed && self.listeners.has_listener(version, Some(&request.stage), false) {
            self.notifier.notify(FlowEvent::new(
                FlowEventKind::RunEnd,
                version,
                &handle.run_id,
                request.node_id(),
            ));
            capture.add_line("Sent run_end event to listeners");
        }

        let (status, response) = match result {
            Ok(response) => {
                capture.add_line(request.end_line(&handle.run_id));
                self.runs.complete(&handle.run_id);
                tracing::info!("✅ Run {} completed with status {}", handle.run_id, response.status);
                (RunStatus::Completed, response)
            }
            Err(err) => {
                let mut message = err.to_string();
                if let Some(details) = err.details() {
                    message = format!("{}\n{}", message, details);
                }
                capture.add_error(&message);
                self.runs.fail(&handle.run_id, &err.to_string());
                tracing::error!("❌ Run {} failed: {}", handle.run_id, err);
                (RunStatus::Failed, FlowResponse::from_error(&err))
            }
        };

        drop(capture);

        DispatchOutcome {
            run_id: handle.run_id,
            status,
            response,
        }
    }

    async fn run_local(
        &self,
        request: &DispatchRequest,
        handle: &RunHandle,
        capture: &ScopedCapture,
    ) -> Result<FlowResponse, DispatchError> {
        let program = self.programs.load(&request.flow_version_id)?;
        let console = capture.console();
        let kind = handle.trigger_kind;

        match &request.trigger {
            Trigger::MockStart { node_id } => {
                let entry = require_entry(program.as_ref(), MOCK_START_ENTRY, StatusCode::BAD_REQUEST)?;
                let call = EntryCall::MockStart {
                    node_id: node_id.clone(),
                    run_id: handle.run_id.clone(),
                    sub_stage: request.sub_stage.clone(),
                };
                let report = self.invoke(&entry, call, console, kind).await?;
                Ok(FlowResponse::json(200, &json!({"status": "mock executed", "result": report})))
            }
            Trigger::ProductionStart { event } => {
                let entry = require_entry(program.as_ref(), PRODUCTION_START_ENTRY, StatusCode::INTERNAL_SERVER_ERROR)?;
                let call = EntryCall::ProductionStart {
                    event: event.clone(),
                    run_id: handle.run_id.clone(),
                    stage: request.stage.clone(),
                };
                let report = self.invoke(&entry, call, console, kind).await?;
                extract_terminal_response(&report, kind)
            }
            Trigger::Resume { run_id, resume_node_id, user_input } => {
                let entry = require_entry(program.as_ref(), RESUME_ENTRY, StatusCode::BAD_REQUEST)?;
                let call = EntryCall::Resume {
                    run_id: run_id.clone(),
                    resume_node_id: resume_node_id.clone(),
                    user_input: user_input.clone(),
                };
                let report = self.invoke(&entry, call, console, kind).await?;
                Ok(FlowResponse::json(200, &json!({"status": "resumed", "result": report})))
            }
            Trigger::ScheduleFire { schedule_id } => {
                let resolved = std::iter::once(PRODUCTION_START_ENTRY)
                    .chain(SCHEDULE_ENTRY_FALLBACKS)
                    .find_map(|name| program.entry(name).map(|entry| (name, entry)));

                let Some((name, entry)) = resolved else {
                    tracing::debug!("📜 Schedule {} has no entry function, running side effects", schedule_id);
                    program
                        .run_side_effects(&console)
                        .map_err(|err| program_failure(kind, err))?;
                    return Ok(FlowResponse::schedule_success());
                };

                tracing::debug!("⏰ Schedule {} entering program via {}", schedule_id, name);
                let call = EntryCall::ProductionStart {
                    event: ProductionEvent::for_schedule(schedule_id),
                    run_id: handle.run_id.clone(),
                    stage: request.stage.clone(),
                };
                let report = self.invoke(&entry, call, console, kind).await?;
                extract_terminal_response(&report, kind)
            }
        }
    }

    async fn invoke(
        &self,
        entry: &EntryPoint,
        call: EntryCall,
        console: Console,
        kind: TriggerKind,
    ) -> Result<ExecutionFlowReport, DispatchError> {
        let args = EntryArgs {
            call,
            console,
            secrets: Arc::clone(&self.secrets),
        };
        entry.invoke(args).await.map_err(|err| program_failure(kind, err))
    }

    async fn run_remote(&self, request: &DispatchRequest, handle: &RunHandle) -> Result<FlowResponse, DispatchError> {
        let kind = handle.trigger_kind;
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| DispatchError::runtime("Remote execution is not configured"))?;

        let invocation = remote::build_invocation(request, &handle.run_id);
        tracing::info!("☁️ Invoking remote function {}", invocation.function_name);

        let value = match tokio::time::timeout(self.remote_timeout, remote.invoke(invocation)).await {
            Ok(Ok(value)) => value,
            Ok(Err(err)) => return Err(DispatchError::runtime_with_details(failure_message(kind), err.to_string())),
            Err(_) => {
                return Err(DispatchError::runtime_with_details(
                    failure_message(kind),
                    format!("Remote executor did not answer within {:?}", self.remote_timeout),
                ))
            }
        };

        remote::map_remote_response(kind, value)
    }
}

fn require_entry(program: &dyn CompiledProgram, name: &str, status: StatusCode) -> Result<EntryPoint, DispatchError> {
    program.entry(name).ok_or_else(|| DispatchError::EntryNotFound {
        entry: name.to_string(),
        status,
    })
}

fn failure_message(kind: TriggerKind) -> &'static str {
    match kind {
        TriggerKind::MockStart => "Mock execution failed",
        TriggerKind::ProductionStart => "Production execution failed",
        TriggerKind::Resume => "Resume execution failed",
        TriggerKind::ScheduleFire => "Schedule execution failed",
    }
}

fn program_failure(kind: TriggerKind, err: ProgramError) -> DispatchError {
    DispatchError::runtime_with_details(failure_message(kind), err.trace())
}
