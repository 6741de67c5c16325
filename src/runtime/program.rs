/// Compiled program contract
///
/// A compiled flow is a value implementing `CompiledProgram`: it exposes named
/// entry functions which the dispatcher resolves per trigger. Entry functions
/// may be async (awaited inline) or blocking (moved to the blocking pool).
/// `GraphProgram` adapts any `FlowInterpreter` into a program exposing the
/// standard entry points.

use crate::logs::Console;
use crate::project::SecretResolver;
use crate::runtime::lifecycle::RunScope;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;

/// Interface revision programs must report to be loadable
pub const PROGRAM_INTERFACE_VERSION: u32 = 1;

pub const MOCK_START_ENTRY: &str = "execute_with_mock_start_node";
pub const PRODUCTION_START_ENTRY: &str = "execute_with_production_start";
pub const RESUME_ENTRY: &str = "execute_with_resume";

/// Tried in order after `execute_with_production_start` for cron fires
pub const SCHEDULE_ENTRY_FALLBACKS: [&str; 6] = [
    "main",
    "execute",
    "run",
    "run_schedule",
    "execute_schedule",
    "schedule_main",
];

/// One node visited by a run, in execution order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutedNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub variables: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

impl ExecutedNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            variables: Value::Object(Default::default()),
            response: None,
        }
    }

    pub fn with_response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_variables(mut self, variables: Value) -> Self {
        self.variables = variables;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFlowReport {
    pub run_id: String,
    pub nodes_order: Vec<ExecutedNode>,
    #[serde(default)]
    pub is_schedule: bool,
}

/// Node definition as returned by the interpreter's lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Inbound production request as handed to the program
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductionEvent {
    pub http_method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub query_string_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub path_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_type: Option<String>,
}

impl ProductionEvent {
    /// Synthetic event handed to a program fired by the cron scheduler
    pub fn for_schedule(schedule_id: &str) -> Self {
        let mut path_parameters = BTreeMap::new();
        path_parameters.insert("schedule_id".to_string(), schedule_id.to_string());

        Self {
            http_method: "POST".to_string(),
            path_parameters,
            execution_type: Some("schedule".to_string()),
            ..Self::default()
        }
    }

    pub fn is_schedule(&self) -> bool {
        self.execution_type.as_deref() == Some("schedule")
    }
}

/// Arguments of one entry function call
#[derive(Debug, Clone)]
pub enum EntryCall {
    MockStart {
        node_id: Option<String>,
        run_id: String,
        sub_stage: Option<String>,
    },
    ProductionStart {
        event: ProductionEvent,
        run_id: String,
        stage: String,
    },
    Resume {
        run_id: String,
        resume_node_id: String,
        user_input: Value,
    },
}

pub struct EntryArgs {
    pub call: EntryCall,
    /// Output written here lands in the run's capture scope
    pub console: Console,
    pub secrets: Arc<dyn SecretResolver>,
}

pub type EntryResult = Result<ExecutionFlowReport, ProgramError>;

type BlockingEntry = dyn Fn(EntryArgs) -> EntryResult + Send + Sync;
type AsyncEntry = dyn Fn(EntryArgs) -> BoxFuture<'static, EntryResult> + Send + Sync;

/// Resolved entry function
#[derive(Clone)]
pub enum EntryPoint {
    Blocking(Arc<BlockingEntry>),
    Async(Arc<AsyncEntry>),
}

impl EntryPoint {
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(EntryArgs) -> EntryResult + Send + Sync + 'static,
    {
        Self::Blocking(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(EntryArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EntryResult> + Send + 'static,
    {
        let entry: Arc<AsyncEntry> = Arc::new(move |args: EntryArgs| f(args).boxed());
        Self::Async(entry)
    }

    /// Run the entry function, turning panics into `ProgramError::Panicked`
    pub async fn invoke(&self, args: EntryArgs) -> EntryResult {
        match self {
            Self::Blocking(f) => {
                let f = Arc::clone(f);
                match tokio::task::spawn_blocking(move || f(args)).await {
                    Ok(result) => result,
                    Err(err) if err.is_panic() => Err(ProgramError::Panicked(panic_message(err.into_panic()))),
                    Err(err) => Err(ProgramError::Panicked(err.to_string())),
                }
            }
            Self::Async(f) => match AssertUnwindSafe(f(args)).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(ProgramError::Panicked(panic_message(payload))),
            },
        }
    }
}

impl std::fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocking(_) => f.write_str("EntryPoint::Blocking"),
            Self::Async(_) => f.write_str("EntryPoint::Async"),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("Node '{0}' not found in flow")]
    NodeNotFound(String),

    #[error("{message}")]
    Execution {
        message: String,
        trace: Option<String>,
    },

    #[error("program panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProgramError {
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            trace: None,
        }
    }

    /// Full error chain, one cause per line
    pub fn trace(&self) -> String {
        match self {
            Self::Execution { message, trace: Some(trace) } => format!("{}\n{}", message, trace),
            Self::Other(err) => err
                .chain()
                .enumerate()
                .map(|(depth, cause)| {
                    if depth == 0 {
                        cause.to_string()
                    } else {
                        format!("caused by: {}", cause)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
            other => other.to_string(),
        }
    }
}

/// A loadable compiled flow
pub trait CompiledProgram: Send + Sync {
    fn version_id(&self) -> &str;

    fn interface_version(&self) -> u32 {
        PROGRAM_INTERFACE_VERSION
    }

    /// Look up an entry function by name
    fn entry(&self, name: &str) -> Option<EntryPoint>;

    /// Module-level work run when a scheduled program exposes no entry function
    fn run_side_effects(&self, _console: &Console) -> Result<(), ProgramError> {
        Ok(())
    }
}

/// Everything a node needs to know about the run it belongs to
#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    pub stage: String,
    pub sub_stage: Option<String>,
    pub scope: RunScope,
    /// Production event, resume user input, or null
    pub input: Value,
    pub console: Console,
    pub secrets: Arc<dyn SecretResolver>,
}

/// External flow interpreter
#[async_trait]
pub trait FlowInterpreter: Send + Sync {
    /// Execute starting from `entry_node`, honoring `ctx.scope`
    async fn execute_node(&self, entry_node: &str, ctx: &RunContext) -> Result<ExecutionFlowReport, ProgramError>;

    async fn get_node_by_id(&self, node_id: &str) -> Option<NodeResult>;
}

/// Program backed by a flow interpreter
pub struct GraphProgram {
    version_id: String,
    interpreter: Arc<dyn FlowInterpreter>,
    entry_node_id: Option<String>,
    is_schedule: bool,
}

impl GraphProgram {
    /// Program exposing mock start and resume only
    pub fn new(version_id: impl Into<String>, interpreter: Arc<dyn FlowInterpreter>) -> Self {
        Self {
            version_id: version_id.into(),
            interpreter,
            entry_node_id: None,
            is_schedule: false,
        }
    }

    /// Node production requests (and cron fires) start from
    pub fn with_entry_node(mut self, node_id: impl Into<String>) -> Self {
        self.entry_node_id = Some(node_id.into());
        self
    }

    /// Mark every report produced by this program as a scheduled run
    pub fn for_schedule(mut self) -> Self {
        self.is_schedule = true;
        self
    }
}

impl CompiledProgram for GraphProgram {
    fn version_id(&self) -> &str {
        &self.version_id
    }

    fn entry(&self, name: &str) -> Option<EntryPoint> {
        let exposed = match name {
            MOCK_START_ENTRY | RESUME_ENTRY => true,
            PRODUCTION_START_ENTRY => self.entry_node_id.is_some(),
            _ => false,
        };
        if !exposed {
            return None;
        }

        let interpreter = Arc::clone(&self.interpreter);
        let entry_node = self.entry_node_id.clone();
        let is_schedule = self.is_schedule;

        Some(EntryPoint::from_async(move |args: EntryArgs| {
            run_graph(Arc::clone(&interpreter), entry_node.clone(), is_schedule, args)
        }))
    }
}

async fn run_graph(
    interpreter: Arc<dyn FlowInterpreter>,
    entry_node: Option<String>,
    is_schedule: bool,
    args: EntryArgs,
) -> EntryResult {
    let EntryArgs { call, console, secrets } = args;
    let missing_entry = || ProgramError::execution("Flow has no entry node");

    let (start_node, ctx, scheduled) = match call {
        EntryCall::MockStart { node_id, run_id, sub_stage } => {
            let (start, scope) = match node_id {
                Some(id) => (id.clone(), RunScope::SingleNode(id)),
                None => (entry_node.ok_or_else(missing_entry)?, RunScope::FullGraph),
            };
            let ctx = RunContext {
                run_id,
                stage: "mock".to_string(),
                sub_stage,
                scope,
                input: Value::Null,
                console,
                secrets,
            };
            (start, ctx, false)
        }
        EntryCall::ProductionStart { event, run_id, stage } => {
            let start = entry_node.ok_or_else(missing_entry)?;
            let scheduled = event.is_schedule();
            let input = serde_json::to_value(&event).map_err(anyhow::Error::from)?;
            let ctx = RunContext {
                run_id,
                stage,
                sub_stage: None,
                scope: RunScope::FullGraph,
                input,
                console,
                secrets,
            };
            (start, ctx, scheduled)
        }
        EntryCall::Resume { run_id, resume_node_id, user_input } => {
            let ctx = RunContext {
                run_id,
                stage: "mock".to_string(),
                sub_stage: None,
                scope: RunScope::FullGraph,
                input: user_input,
                console,
                secrets,
            };
            (resume_node_id, ctx, false)
        }
    };

    if interpreter.get_node_by_id(&start_node).await.is_none() {
        return Err(ProgramError::NodeNotFound(start_node));
    }

    let mut report = interpreter.execute_node(&start_node, &ctx).await?;
    report.is_schedule |= is_schedule || scheduled;
    Ok(report)
}
