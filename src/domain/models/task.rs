//! Task domain model.
//!
//! Tasks are the unit of work handed to workers. They move through a review
//! pipeline (developer, tech lead, PM, merge) and are never deleted; only
//! their status changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::models::ids::issue_id;

/// Status of a task in the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued and waiting to be claimed
    Todo,
    /// Claimed by a worker and being implemented
    Doing,
    /// Submitted, waiting for the tech lead
    InReview,
    /// Tech lead accepted, waiting for the PM
    WaitAccept,
    /// PM accepted, waiting for integration
    Accepted,
    /// Integrated onto the target branch
    Done,
    /// Sent back for rework
    Rejected,
    /// Stuck until someone fixes the environment
    Blocked,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Todo
    }
}

impl TaskStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 8] = [
        Self::Todo,
        Self::Doing,
        Self::InReview,
        Self::WaitAccept,
        Self::Accepted,
        Self::Done,
        Self::Rejected,
        Self::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Doing => "doing",
            Self::InReview => "in_review",
            Self::WaitAccept => "wait_accept",
            Self::Accepted => "accepted",
            Self::Done => "done",
            Self::Rejected => "rejected",
            Self::Blocked => "blocked",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "todo" => Some(Self::Todo),
            "doing" => Some(Self::Doing),
            "in_review" | "review" => Some(Self::InReview),
            "wait_accept" => Some(Self::WaitAccept),
            "accepted" => Some(Self::Accepted),
            "done" => Some(Self::Done),
            "rejected" => Some(Self::Rejected),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }

    /// Whether a worker may claim a task in this status.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Todo | Self::Rejected)
    }

    /// Whether the task sits in one of the acceptance stages.
    pub fn is_review_stage(&self) -> bool {
        matches!(self, Self::InReview | Self::WaitAccept | Self::Accepted)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    #[default]
    Implementation,
    /// Tech lead review of a submitted implementation
    TlReview,
    /// PM acceptance review
    PmReview,
    /// Tech lead merge step
    TlMerge,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implementation => "implementation",
            Self::TlReview => "tl_review",
            Self::PmReview => "pm_review",
            Self::TlMerge => "tl_merge",
        }
    }

    pub fn is_review(&self) -> bool {
        !matches!(self, Self::Implementation)
    }

    /// Title prefix used for spawned review tasks.
    pub fn title_prefix(&self) -> &'static str {
        match self {
            Self::Implementation => "",
            Self::TlReview => "[TL Review]",
            Self::PmReview => "[PM Review]",
            Self::TlMerge => "[TL Merge]",
        }
    }
}

/// A unit of work tracked by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    /// Implementation task this review task points at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_target_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub rework_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rework_reason: Option<String>,
    #[serde(default)]
    pub rework_count: u32,
    /// Why the task was last blocked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a fresh `todo` implementation task.
    pub fn new(title: impl Into<String>, description: Option<String>) -> Self {
        Self::with_id(issue_id("task"), title, description)
    }

    pub fn with_id(id: impl Into<String>, title: impl Into<String>, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description,
            status: TaskStatus::Todo,
            task_type: None,
            review_target_task_id: None,
            assignee: None,
            workflow_id: None,
            rework_requested: false,
            rework_reason: None,
            rework_count: 0,
            block_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Effective type; tasks without an explicit type are implementation work.
    pub fn kind(&self) -> TaskType {
        self.task_type.unwrap_or_default()
    }

    pub fn is_review_task(&self) -> bool {
        self.kind().is_review()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// De-duplication token used by the execution scheduler.
    pub fn execution_token(&self) -> String {
        format!("{}:{}", self.status, self.updated_at.to_rfc3339())
    }
}
