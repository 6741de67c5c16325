/// flowgate: execution dispatch and resume coordinator for compiled flows
///
/// This library routes mock, production, resume and cron triggers into compiled
/// flow programs (in-process or on a remote executor), captures their output,
/// tracks run lifecycles and notifies live observers.

// Core configuration and setup
pub mod config;

// Caller-facing dispatch errors
pub mod error;

// In-memory log capture keyed by (source, variant)
pub mod logs;

// Live observer registrations and run events
pub mod listeners;

// Project lookup and secret resolution
pub mod project;

// Published schedules and their SQLite persistence
pub mod schedule;

// Program registry, dispatcher, run tracking and cron scheduling
pub mod runtime;

// HTTP API layer - execution, listener and schedule endpoints
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::DispatchError;
pub use project::{Project, ProjectCatalog};
pub use runtime::{CompiledProgram, DispatchRequest, Dispatcher, GraphProgram, ProgramRegistry};
pub use server::start_server;
