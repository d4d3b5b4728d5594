//! Async run tracking and per-task execution provenance.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::models::ids::issue_id;

/// Status of an asynchronous worker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

/// Record of an asynchronous `startRunWorkerTask` invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub task_id: String,
    pub agent_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
}

impl RunRecord {
    pub fn queued(task_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: issue_id("run"),
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            status: RunStatus::Queued,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            base_branch: None,
            branch: None,
            worktree_path: None,
            summary: None,
            result: None,
            error: None,
            cancel_requested: false,
        }
    }
}

/// Provenance of the latest execution against a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunMeta {
    pub task_id: String,
    pub agent_id: String,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub diff_length: usize,
    /// The run produced a non-empty diff
    pub provenance_ok: bool,
    pub verify_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_command_key: Option<String>,
    pub verified: bool,
    pub last_run_at: DateTime<Utc>,
}

impl TaskRunMeta {
    /// Whether the provenance/verify gate for `done` is satisfied.
    pub fn gate_error(&self) -> Option<crate::domain::errors::ErrorKind> {
        use crate::domain::errors::ErrorKind;
        if !self.provenance_ok {
            Some(ErrorKind::ProvenanceRequired)
        } else if self.verify_required && !self.verified {
            Some(ErrorKind::VerifyRequired)
        } else {
            None
        }
    }
}
