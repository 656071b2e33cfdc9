use serde::{Deserialize, Serialize};

pub const OK_STATUS: &str = "ok";

/// Aggregate snapshot of the service, computed on demand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub status: String,
    pub rest_version: String,
    /// 1, 5 and 15 minute load averages, -1 when unknown
    pub load: Vec<f32>,
    /// Percentage of the task directory's filesystem in use
    pub pc_disk_full: i32,
    pub queued_tasks: usize,
    pub completed_tasks: usize,
    pub canceled_tasks: usize,
}
