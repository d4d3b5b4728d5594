//! Domain errors for the cowai orchestrator.
//!
//! Every caller-facing operation returns [`OpResult`]. The error carries a
//! stable [`ErrorKind`] string plus structured detail so a caller can react
//! without reading server logs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::domain::models::CommandResult;

/// Stable error kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    TaskNotFound,
    WorkerNotFound,
    RunNotFound,
    WorkflowNotFound,
    InvalidState,
    InvalidTransition,
    InvalidMessage,
    InvalidArgument,
    AssigneeMismatch,
    ReworkPriorityRequired,
    WorktreeListFailed,
    WorktreeNotFound,
    WorktreeBranchCheckFailed,
    WorktreeBranchMismatch,
    WorktreeAddFailed,
    WorktreeSetupFailed,
    WorktreeRequired,
    NotGitRepo,
    CommandRejected,
    CwdRejected,
    PolicyLoadFailed,
    ProvenanceRequired,
    VerifyRequired,
    AutoIntegrateFailed,
    StoryRequired,
    AgentRolesRequired,
    RepoPathRequired,
    LoadRolesFailed,
    ReloadFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::WorkerNotFound => "WORKER_NOT_FOUND",
            Self::RunNotFound => "RUN_NOT_FOUND",
            Self::WorkflowNotFound => "WORKFLOW_NOT_FOUND",
            Self::InvalidState => "INVALID_STATE",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::InvalidMessage => "INVALID_MESSAGE",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::AssigneeMismatch => "ASSIGNEE_MISMATCH",
            Self::ReworkPriorityRequired => "REWORK_PRIORITY_REQUIRED",
            Self::WorktreeListFailed => "WORKTREE_LIST_FAILED",
            Self::WorktreeNotFound => "WORKTREE_NOT_FOUND",
            Self::WorktreeBranchCheckFailed => "WORKTREE_BRANCH_CHECK_FAILED",
            Self::WorktreeBranchMismatch => "WORKTREE_BRANCH_MISMATCH",
            Self::WorktreeAddFailed => "WORKTREE_ADD_FAILED",
            Self::WorktreeSetupFailed => "WORKTREE_SETUP_FAILED",
            Self::WorktreeRequired => "WORKTREE_REQUIRED",
            Self::NotGitRepo => "NOT_GIT_REPO",
            Self::CommandRejected => "COMMAND_REJECTED",
            Self::CwdRejected => "CWD_REJECTED",
            Self::PolicyLoadFailed => "POLICY_LOAD_FAILED",
            Self::ProvenanceRequired => "PROVENANCE_REQUIRED",
            Self::VerifyRequired => "VERIFY_REQUIRED",
            Self::AutoIntegrateFailed => "AUTO_INTEGRATE_FAILED",
            Self::StoryRequired => "STORY_REQUIRED",
            Self::AgentRolesRequired => "AGENT_ROLES_REQUIRED",
            Self::RepoPathRequired => "REPO_PATH_REQUIRED",
            Self::LoadRolesFailed => "LOAD_ROLES_FAILED",
            Self::ReloadFailed => "RELOAD_FAILED",
        }
    }

    /// Caller errors that will fail the same way on retry.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound
                | Self::WorkerNotFound
                | Self::RunNotFound
                | Self::WorkflowNotFound
                | Self::InvalidState
                | Self::InvalidTransition
                | Self::InvalidMessage
                | Self::InvalidArgument
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure of a caller-facing operation.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind}: {message}")]
pub struct OpError {
    pub kind: ErrorKind,
    pub message: String,
    pub detail: Value,
}

pub type OpResult<T> = Result<T, OpError>;

impl OpError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: Value::Null,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }

    /// Attach a captured command result as detail.
    #[must_use]
    pub fn with_command(self, result: &CommandResult) -> Self {
        let detail = serde_json::to_value(result).unwrap_or(Value::Null);
        self.with_detail(json!({ "command": detail }))
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::new(ErrorKind::TaskNotFound, format!("Task not found: {task_id}"))
            .with_detail(json!({ "taskId": task_id }))
    }

    pub fn worker_not_found(agent_id: &str) -> Self {
        Self::new(ErrorKind::WorkerNotFound, format!("Worker not found: {agent_id}"))
            .with_detail(json!({ "agentId": agent_id }))
    }

    pub fn invalid_state(task_id: &str, status: impl std::fmt::Display, expected: &str) -> Self {
        Self::new(
            ErrorKind::InvalidState,
            format!("Task {task_id} is {status}; expected {expected}"),
        )
        .with_detail(json!({ "taskId": task_id, "status": status.to_string(), "expected": expected }))
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// Wire shape used by the RPC adapter: `{ok:false, error, message, detail}`.
    pub fn to_json(&self) -> Value {
        json!({
            "ok": false,
            "error": self.kind.as_str(),
            "message": self.message,
            "detail": self.detail,
        })
    }
}

/// Errors raised while loading or applying a repository policy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Failed to load policy {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("Command key '{0}' is not allowed by policy")]
    NotAllowed(String),

    #[error("Raw command '{0}' rejected: not a named policy command and raw commands are forbidden")]
    RawForbidden(String),
}

impl From<PolicyError> for OpError {
    fn from(err: PolicyError) -> Self {
        let kind = match err {
            PolicyError::Load { .. } => ErrorKind::PolicyLoadFailed,
            PolicyError::NotAllowed(_) | PolicyError::RawForbidden(_) => ErrorKind::CommandRejected,
        };
        Self::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_screaming_snake() {
        let value = serde_json::to_value(ErrorKind::ReworkPriorityRequired).unwrap();
        assert_eq!(value, "REWORK_PRIORITY_REQUIRED");
        assert_eq!(ErrorKind::WorktreeBranchMismatch.as_str(), "WORKTREE_BRANCH_MISMATCH");
    }

    #[test]
    fn test_as_str_matches_serde() {
        for kind in [
            ErrorKind::TaskNotFound,
            ErrorKind::CwdRejected,
            ErrorKind::AutoIntegrateFailed,
            ErrorKind::ReloadFailed,
        ] {
            assert_eq!(serde_json::to_value(kind).unwrap(), kind.as_str());
        }
    }

    #[test]
    fn test_op_error_wire_shape() {
        let err = OpError::task_not_found("t1");
        let json = err.to_json();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "TASK_NOT_FOUND");
        assert_eq!(json["detail"]["taskId"], "t1");
        assert!(err.kind.is_caller_error());
    }

    #[test]
    fn test_policy_error_maps_to_kind() {
        let load: OpError = PolicyError::Load {
            path: "p".into(),
            reason: "missing".into(),
        }
        .into();
        assert_eq!(load.kind, ErrorKind::PolicyLoadFailed);
        let raw: OpError = PolicyError::RawForbidden("lint".into()).into();
        assert_eq!(raw.kind, ErrorKind::CommandRejected);
    }
}
