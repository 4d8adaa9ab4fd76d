//! Generation Workload Models
//!
//! Shared types describing one generation workload: which workflow it runs
//! and what the lifecycle manager needs to start it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The kind of external generation workload a task runs.
///
/// `Build` is the scripted backend runner (plan, implement, QA). `Ideation`
/// is the interactive agent CLI producing idea artifacts per sub-type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    Build,
    Ideation,
}

impl std::fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowKind::Build => write!(f, "build"),
            WorkflowKind::Ideation => write!(f, "ideation"),
        }
    }
}

/// Request to start one generation workload under a task key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStartRequest {
    /// Logical task identity (spec or project identifier)
    pub task_key: String,
    /// Working directory for the spawned process; result artifacts are read
    /// relative to this path at completion
    pub work_path: PathBuf,
    /// Extra arguments appended to the runner invocation
    #[serde(default)]
    pub args: Vec<String>,
    /// Which workload kind this task runs
    pub workflow: WorkflowKind,
    /// Expected sub-item count for fan-out progress (ideation only)
    #[serde(default)]
    pub expected_sub_items: Option<usize>,
}

impl GenerationStartRequest {
    /// Create a minimal start request
    pub fn new(
        task_key: impl Into<String>,
        work_path: impl Into<PathBuf>,
        workflow: WorkflowKind,
    ) -> Self {
        Self {
            task_key: task_key.into(),
            work_path: work_path.into(),
            args: Vec::new(),
            workflow,
            expected_sub_items: None,
        }
    }

    /// Append runner arguments
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the expected sub-item count used for fan-out progress
    pub fn with_expected_sub_items(mut self, count: usize) -> Self {
        self.expected_sub_items = Some(count);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_kind_display() {
        assert_eq!(WorkflowKind::Build.to_string(), "build");
        assert_eq!(WorkflowKind::Ideation.to_string(), "ideation");
    }

    #[test]
    fn test_workflow_kind_serde() {
        let json = serde_json::to_string(&WorkflowKind::Ideation).unwrap();
        assert_eq!(json, "\"ideation\"");
        let kind: WorkflowKind = serde_json::from_str("\"build\"").unwrap();
        assert_eq!(kind, WorkflowKind::Build);
    }

    #[test]
    fn test_start_request_builder() {
        let request = GenerationStartRequest::new("spec-1", "/work", WorkflowKind::Ideation)
            .with_args(vec!["--mode".to_string(), "full".to_string()])
            .with_expected_sub_items(8);

        assert_eq!(request.task_key, "spec-1");
        assert_eq!(request.args.len(), 2);
        assert_eq!(request.expected_sub_items, Some(8));
    }

    #[test]
    fn test_start_request_serialization() {
        let request = GenerationStartRequest::new("spec-1", "/work", WorkflowKind::Build);
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"taskKey\":\"spec-1\""));
        assert!(json.contains("\"workflow\":\"build\""));
    }
}
