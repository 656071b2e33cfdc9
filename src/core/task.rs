//! Task request and result types
//!
//! A `TaskResult` is never mutated across phases: each status transition
//! builds a fresh value (`submitted` -> `processing` -> `complete`/`failed`).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock time in unix milliseconds
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Request to run an algorithm on some input data
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Name of the algorithm to run
    #[serde(default)]
    pub algorithm: Option<String>,
    /// Input payload. A JSON string is treated as plain text.
    #[serde(default)]
    pub data: Option<Value>,
    /// Custom parameters in declaration order. A `None` value is a flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_parameters: Option<IndexMap<String, Option<String>>>,
}

impl TaskRequest {
    pub fn new(algorithm: impl Into<String>, data: Value) -> Self {
        Self {
            algorithm: Some(algorithm.into()),
            data: Some(data),
            custom_parameters: None,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.custom_parameters
            .get_or_insert_with(IndexMap::new)
            .insert(name.into(), value.map(|v| v.to_string()));
        self
    }

    /// Text written to the task's input file: plain text payloads verbatim,
    /// structured payloads as compact JSON.
    pub fn input_text(&self) -> Option<String> {
        match self.data.as_ref()? {
            Value::String(text) => Some(text.clone()),
            other => Some(other.to_string()),
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Submitted,
    Processing,
    Complete,
    Failed,
}

impl TaskState {
    /// Settled tasks never transition again
    pub fn is_settled(&self) -> bool {
        matches!(self, TaskState::Complete | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Submitted => "submitted",
            TaskState::Processing => "processing",
            TaskState::Complete => "complete",
            TaskState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Full result of a task, including the output payload once settled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub id: String,
    pub status: TaskState,
    /// 0-100
    #[serde(default)]
    pub progress: u8,
    /// Unix ms when the task was submitted
    #[serde(default)]
    pub start_time: u64,
    /// Elapsed execution time in ms
    #[serde(default)]
    pub wall_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl TaskResult {
    pub fn submitted(id: impl Into<String>, start_time: u64) -> Self {
        Self {
            id: id.into(),
            status: TaskState::Submitted,
            progress: 0,
            start_time,
            wall_time: 0,
            message: None,
            result: None,
        }
    }

    pub fn processing(id: impl Into<String>, start_time: u64) -> Self {
        Self {
            status: TaskState::Processing,
            ..Self::submitted(id, start_time)
        }
    }

    /// Settle as COMPLETE with the given payload
    pub fn complete(self, result: Option<Value>, wall_time: u64) -> Self {
        self.settle(TaskState::Complete, None, result, wall_time)
    }

    /// Settle as FAILED with a message and an optional payload
    pub fn failed(self, message: impl Into<String>, result: Option<Value>, wall_time: u64) -> Self {
        self.settle(TaskState::Failed, Some(message.into()), result, wall_time)
    }

    fn settle(
        self,
        status: TaskState,
        message: Option<String>,
        result: Option<Value>,
        wall_time: u64,
    ) -> Self {
        Self {
            id: self.id,
            status,
            progress: 100,
            start_time: self.start_time,
            wall_time,
            message,
            result,
        }
    }
}

/// Cheap projection of a `TaskResult` without the output payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusView {
    pub status: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub progress: u8,
    pub wall_time: u64,
}

impl From<&TaskResult> for TaskStatusView {
    fn from(result: &TaskResult) -> Self {
        Self {
            status: result.status,
            message: result.message.clone(),
            progress: result.progress,
            wall_time: result.wall_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_text_plain_and_structured() {
        let text = TaskRequest::new("algo", json!("blah"));
        assert_eq!(text.input_text().as_deref(), Some("blah"));

        let structured = TaskRequest::new("algo", json!({"blah": "data"}));
        assert_eq!(structured.input_text().as_deref(), Some(r#"{"blah":"data"}"#));

        assert_eq!(TaskRequest::default().input_text(), None);
    }

    #[test]
    fn test_custom_parameters_keep_insertion_order() {
        let req = TaskRequest::new("algo", json!("x"))
            .with_parameter("zeta", None)
            .with_parameter("alpha", Some("1"));
        let names: Vec<&String> = req.custom_parameters.as_ref().unwrap().keys().collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let req: TaskRequest = serde_json::from_str(
            r#"{"algorithm": "louvain", "data": [1, 2], "customParameters": {"--directed": null, "--seed": "5"}}"#,
        )
        .unwrap();
        assert_eq!(req.algorithm.as_deref(), Some("louvain"));
        let params = req.custom_parameters.unwrap();
        assert_eq!(params.get("--directed"), Some(&None));
        assert_eq!(params.get("--seed"), Some(&Some("5".to_string())));
    }

    #[test]
    fn test_phases_build_fresh_values() {
        let submitted = TaskResult::submitted("1", 42);
        assert_eq!(submitted.status, TaskState::Submitted);
        assert_eq!(submitted.progress, 0);

        let processing = TaskResult::processing("1", 42);
        assert_eq!(processing.status, TaskState::Processing);
        assert_eq!(processing.start_time, 42);

        let failed = processing.clone().failed("boom", None, 7);
        assert_eq!(failed.status, TaskState::Failed);
        assert_eq!(failed.progress, 100);
        assert_eq!(failed.wall_time, 7);
        assert_eq!(failed.message.as_deref(), Some("boom"));
        assert!(failed.status.is_settled());

        let complete = processing.complete(Some(json!({"a": 1})), 3);
        assert_eq!(complete.status, TaskState::Complete);
        assert!(complete.message.is_none());
    }

    #[test]
    fn test_status_view_omits_payload() {
        let result = TaskResult::processing("1", 0).complete(Some(json!("big")), 10);
        let view = TaskStatusView::from(&result);
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "complete");
        assert_eq!(json["wallTime"], 10);
        assert!(json.get("result").is_none());
    }
}
