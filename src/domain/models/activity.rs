//! Activity audit trail entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::models::ids::issue_id;

/// Maximum number of events kept in memory.
pub const ACTIVITY_LOG_CAP: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Workflow,
    Agent,
    System,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

/// One append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: ActivityType,
    pub action: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl ActivityEvent {
    pub fn new(kind: ActivityType, action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            id: issue_id("evt"),
            timestamp: Utc::now(),
            kind,
            action: action.into(),
            detail: detail.into(),
            agent_id: None,
            workflow_id: None,
            run_id: None,
        }
    }

    pub fn workflow(action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(ActivityType::Workflow, action, detail)
    }

    pub fn agent(action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(ActivityType::Agent, action, detail)
    }

    pub fn system(action: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(ActivityType::System, action, detail)
    }

    #[must_use]
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    #[must_use]
    pub fn with_workflow(mut self, workflow_id: Option<String>) -> Self {
        self.workflow_id = workflow_id;
        self
    }

    #[must_use]
    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// One-line rendering used by `activityLog` text output.
    pub fn to_line(&self) -> String {
        let mut line = format!(
            "{} [{}] {}",
            self.timestamp.to_rfc3339(),
            self.kind.as_str(),
            self.action
        );
        if let Some(agent) = &self.agent_id {
            line.push_str(&format!(" agent={agent}"));
        }
        if let Some(workflow) = &self.workflow_id {
            line.push_str(&format!(" workflow={workflow}"));
        }
        if let Some(run) = &self.run_id {
            line.push_str(&format!(" run={run}"));
        }
        if !self.detail.is_empty() {
            line.push_str(" - ");
            line.push_str(&self.detail);
        }
        line
    }
}

/// Filters accepted by activity queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivityFilter {
    pub workflow_id: Option<String>,
    pub agent_id: Option<String>,
    pub run_id: Option<String>,
}

impl ActivityFilter {
    pub fn matches(&self, event: &ActivityEvent) -> bool {
        fn check(want: Option<&String>, have: Option<&String>) -> bool {
            want.is_none_or(|w| have == Some(w))
        }
        check(self.workflow_id.as_ref(), event.workflow_id.as_ref())
            && check(self.agent_id.as_ref(), event.agent_id.as_ref())
            && check(self.run_id.as_ref(), event.run_id.as_ref())
    }
}
