/// Schedule definitions and their persistence

pub mod storage;
pub mod types;

pub use storage::ScheduleStorage;
pub use types::ScheduleJob;
