//! Story workflow model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::models::ids::issue_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Waiting on answers to clarifying questions
    AwaitingUser,
    /// Tasks decomposed, nothing claimed yet
    Ready,
    Executing,
    /// Every task reached acceptance
    Verified,
    /// Every task done and a report produced
    Reported,
    Blocked,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingUser => "awaiting_user",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Verified => "verified",
            Self::Reported => "reported",
            Self::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoryQuestion {
    pub id: String,
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
}

impl StoryQuestion {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            id: issue_id("q"),
            question: question.into(),
            answer: None,
        }
    }

    pub fn is_answered(&self) -> bool {
        self.answer.as_ref().is_some_and(|a| !a.trim().is_empty())
    }
}

/// An answer supplied by the caller for a clarifying question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoryAnswer {
    pub question_id: String,
    pub answer: String,
}

/// A story decomposed into tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoryWorkflow {
    pub id: String,
    pub story: String,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub questions: Vec<StoryQuestion>,
    /// Ids of the tasks enqueued for this story, in creation order
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
}

fn default_base_branch() -> String {
    "main".to_string()
}

impl StoryWorkflow {
    pub fn new(story: impl Into<String>, questions: Vec<StoryQuestion>, base_branch: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: issue_id("wf"),
            story: story.into(),
            status: WorkflowStatus::AwaitingUser,
            created_at: now,
            updated_at: now,
            questions,
            task_ids: Vec::new(),
            base_branch: base_branch.into(),
            report: None,
        }
    }

    pub fn has_unanswered(&self) -> bool {
        self.questions.iter().any(|q| !q.is_answered())
    }

    pub fn is_decomposed(&self) -> bool {
        !self.task_ids.is_empty()
    }
}
