pub mod status;
pub mod task;

pub use status::ServerStatus;
pub use task::{now_ms, TaskRequest, TaskResult, TaskState, TaskStatusView};
