/// Runtime execution layer
///
/// This module owns everything between an accepted trigger and its response:
/// - Compiled program contract and the hot-swappable program registry
/// - Run lifecycle tracking and terminal response extraction
/// - Local/remote dispatch with log capture and observer notification
/// - Cron scheduling with per-job fire guards and a dedicated worker pool

// Compiled program contract and interpreter adapter
pub mod program;

// Version-keyed ArcSwap registry of compiled programs
pub mod registry;

// Run records and response extraction
pub mod lifecycle;

// Serverless executor client
pub mod remote;

// Trigger dispatch (local or remote)
pub mod dispatcher;

// At-most-one-execution and misfire coalescing per schedule
pub mod guard;

// OS-thread worker pool executing cron fires
pub mod worker;

// Background cron scheduler service for published schedules
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types
pub use dispatcher::{DispatchOutcome, DispatchRequest, Dispatcher, Trigger};
pub use lifecycle::{FlowResponse, RunRecord, RunStatus, RunTracker, TriggerKind};
pub use program::{CompiledProgram, EntryPoint, ExecutionFlowReport, FlowInterpreter, GraphProgram};
pub use registry::ProgramRegistry;
pub use remote::{HttpRemoteExecutor, RemoteExecutor};
pub use scheduler::CronSchedulerService;
pub use worker::ScheduleWorkerPool;
