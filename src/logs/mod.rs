/// Log capture layer
///
/// In-memory, per-key log buffers fed by scoped captures around each run.

pub mod capture;
pub mod store;

pub use capture::{Console, ConsoleWriter, ScopedCapture};
pub use store::{ExecutionKey, LogEntry, LogStats, LogStore};
