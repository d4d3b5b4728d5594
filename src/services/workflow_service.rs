//! Story workflows.
//!
//! A story is clarified with up to three questions, decomposed into tasks
//! routed by role and optionally claimed so the execution loop picks them
//! up. Each call re-derives the workflow status from its tasks.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::domain::models::{
    ActivityEvent, ActivityFilter, AgentRoleProfile, Role, StoryAnswer, StoryQuestion, StoryWorkflow, Task,
    TaskStatus, WorkflowStatus,
};
use crate::domain::{ErrorKind, OpError, OpResult};
use crate::services::lifecycle::TaskLifecycle;
use crate::services::task_store::AppState;
use crate::services::worker_registry::{read_roles_file, roles_file_path};

const MAX_CLAUSES: usize = 3;
const ACTIVITY_TAIL: usize = 30;

struct Cue {
    needles: &'static [&'static str],
    question: &'static str,
}

const CUES: [Cue; 3] = [
    Cue {
        needles: &["acceptance", "受け入れ", "完了条件"],
        question: "What are the acceptance criteria (how do we judge success)?",
    },
    Cue {
        needles: &["scope", "対象外", "非機能"],
        question: "Is anything explicitly out of scope for this story?",
    },
    Cue {
        needles: &["constraint", "制約", "互換"],
        question: "Are there technical constraints (libraries, forbidden changes, compatibility)?",
    },
];

/// Questions for every cue the story does not mention.
pub fn clarifying_questions(story: &str) -> Vec<StoryQuestion> {
    let lower = story.to_lowercase();
    CUES.iter()
        .filter(|cue| !cue.needles.iter().any(|n| lower.contains(n)))
        .map(|cue| StoryQuestion::new(cue.question))
        .take(3)
        .collect()
}

/// First few non-empty clauses of a story.
pub fn story_clauses(story: &str) -> Vec<String> {
    story
        .split(['\n', '。', '.'])
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .take(MAX_CLAUSES)
        .map(str::to_string)
        .collect()
}

/// Split a story into implementation tasks plus one acceptance task.
pub fn decompose(workflow_id: &str, story: &str, roles: &[AgentRoleProfile]) -> Vec<Task> {
    let developers: Vec<&AgentRoleProfile> = roles.iter().filter(|r| r.kind == Role::Developer).collect();
    let implementers: Vec<&AgentRoleProfile> = if developers.is_empty() {
        roles.iter().collect()
    } else {
        developers
    };
    let assignee_at = |i: usize| {
        (!implementers.is_empty()).then(|| implementers[i % implementers.len()].agent_id.clone())
    };

    let new_task = |title: String, description: String, assignee: Option<String>| {
        let mut task = Task::new(format!("[{workflow_id}] {title}"), Some(description));
        task.workflow_id = Some(workflow_id.to_string());
        task.assignee = assignee;
        task
    };

    let mut tasks: Vec<Task> = story_clauses(story)
        .into_iter()
        .enumerate()
        .map(|(i, clause)| new_task(format!("Implement {}", i + 1), clause, assignee_at(i)))
        .collect();
    if tasks.is_empty() {
        tasks.push(new_task(
            "Implement".to_string(),
            "Implement the requirements of the story".to_string(),
            assignee_at(0),
        ));
    }

    let acceptor = roles
        .iter()
        .find(|r| r.is_pm || r.kind == Role::Pm)
        .or_else(|| roles.iter().find(|r| r.kind == Role::Qa))
        .map(|r| r.agent_id.clone())
        .or_else(|| assignee_at(0));
    tasks.push(new_task(
        "Inspect and accept".to_string(),
        "Inspect the result of the change and decide acceptance".to_string(),
        acceptor,
    ));
    tasks
}

/// Status implied by the workflow's tasks, if any rule applies.
fn derived_status(tasks: &[&Task]) -> Option<WorkflowStatus> {
    if tasks.is_empty() {
        return None;
    }
    if tasks.iter().any(|t| t.status == TaskStatus::Blocked) {
        return Some(WorkflowStatus::Blocked);
    }
    if tasks.iter().all(|t| t.status == TaskStatus::Done) {
        return Some(WorkflowStatus::Reported);
    }
    let past_acceptance = |s: TaskStatus| matches!(s, TaskStatus::WaitAccept | TaskStatus::Accepted | TaskStatus::Done);
    if tasks.iter().all(|t| past_acceptance(t.status)) {
        return Some(WorkflowStatus::Verified);
    }
    None
}

fn report_line(workflow: &StoryWorkflow, tasks: &[&Task]) -> String {
    let count = |s: TaskStatus| tasks.iter().filter(|t| t.status == s).count();
    format!(
        "workflow={}; status={}; base={}; done={}/{}; inReview={}; blocked={}",
        workflow.id,
        workflow.status.as_str(),
        workflow.base_branch,
        count(TaskStatus::Done),
        tasks.len(),
        count(TaskStatus::InReview) + count(TaskStatus::WaitAccept) + count(TaskStatus::Accepted),
        count(TaskStatus::Blocked),
    )
}

/// Re-derive the workflow status and report. Logs `workflow_reported` when
/// the workflow first reaches `reported`.
fn refresh(state: &mut AppState, events: &mut Vec<ActivityEvent>, workflow_id: &str) {
    let Some(workflow) = state.workflow(workflow_id) else {
        return;
    };
    let tasks: Vec<&Task> = workflow.task_ids.iter().filter_map(|id| state.task(id)).collect();
    let derived = derived_status(&tasks);
    let mut next = workflow.clone();
    if let Some(status) = derived {
        next.status = status;
    }
    let report = report_line(&next, &tasks);
    let newly_reported = next.status == WorkflowStatus::Reported && workflow.status != WorkflowStatus::Reported;

    if let Some(workflow) = state.workflow_mut(workflow_id) {
        if workflow.status != next.status || workflow.report.as_deref() != Some(report.as_str()) {
            workflow.status = next.status;
            workflow.report = Some(report.clone());
            workflow.updated_at = Utc::now();
        }
    }
    if newly_reported {
        events.push(
            ActivityEvent::workflow("workflow_reported", report).with_workflow(Some(workflow_id.to_string())),
        );
    }
}

/// Input of `runStoryWorkflow`.
#[derive(Debug, Clone)]
pub struct StoryRequest {
    pub workflow_id: Option<String>,
    pub story: Option<String>,
    pub answers: Vec<StoryAnswer>,
    pub auto_execute: bool,
    pub base_branch: String,
}

impl Default for StoryRequest {
    fn default() -> Self {
        Self {
            workflow_id: None,
            story: None,
            answers: Vec::new(),
            auto_execute: true,
            base_branch: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoryOutcome {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    /// Questions still waiting for an answer
    pub questions: Vec<StoryQuestion>,
    pub tasks: Vec<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    pub activity_tail: Vec<ActivityEvent>,
}

pub struct WorkflowService {
    lifecycle: Arc<TaskLifecycle>,
}

impl WorkflowService {
    pub fn new(lifecycle: Arc<TaskLifecycle>) -> Self {
        Self { lifecycle }
    }

    #[instrument(skip(self, req), fields(workflow_id = ?req.workflow_id))]
    pub async fn run(&self, req: &StoryRequest) -> OpResult<StoryOutcome> {
        let store = self.lifecycle.store();
        let workflow_id = store
            .mutate(|state, events| Self::open_workflow(state, events, req))
            .await?;

        let unanswered = store
            .mutate(|state, _| {
                let workflow = state.workflow_mut(&workflow_id)?;
                if workflow.has_unanswered() {
                    workflow.status = WorkflowStatus::AwaitingUser;
                    workflow.updated_at = Utc::now();
                    return Some(true);
                }
                Some(false)
            })
            .await
            .unwrap_or(false);
        if unanswered {
            return Ok(self.outcome(&workflow_id).await);
        }

        let decomposed = store
            .read(|s| s.workflow(&workflow_id).is_some_and(StoryWorkflow::is_decomposed))
            .await;
        if !decomposed {
            self.ensure_roles(&workflow_id).await;
            store
                .mutate(|state, events| Self::decompose_into(state, events, &workflow_id))
                .await?;
        }

        if req.auto_execute {
            self.claim_all(&workflow_id).await;
        }

        store
            .mutate(|state, events| {
                if let Some(workflow) = state.workflow_mut(&workflow_id) {
                    let target = if req.auto_execute {
                        WorkflowStatus::Executing
                    } else {
                        WorkflowStatus::Ready
                    };
                    if matches!(workflow.status, WorkflowStatus::AwaitingUser | WorkflowStatus::Ready) {
                        workflow.status = target;
                        workflow.updated_at = Utc::now();
                    }
                }
                refresh(state, events, &workflow_id);
            })
            .await;

        let outcome = self.outcome(&workflow_id).await;
        info!(workflow_id = %outcome.workflow_id, status = outcome.status.as_str(), "story workflow updated");
        Ok(outcome)
    }

    /// Find or create the workflow and apply answers.
    fn open_workflow(state: &mut AppState, events: &mut Vec<ActivityEvent>, req: &StoryRequest) -> OpResult<String> {
        let existing = req
            .workflow_id
            .as_deref()
            .and_then(|id| state.workflow(id))
            .map(|w| w.id.clone());
        let story = req.story.as_deref().map(str::trim).filter(|s| !s.is_empty());

        let workflow_id = match (existing, story) {
            (Some(id), _) => id,
            (None, Some(story)) => {
                let workflow = StoryWorkflow::new(story, clarifying_questions(story), req.base_branch.clone());
                let id = workflow.id.clone();
                state.workflows.push(workflow);
                events.push(
                    ActivityEvent::workflow("workflow_created", "Created from story request")
                        .with_workflow(Some(id.clone())),
                );
                id
            }
            (None, None) => {
                if let Some(id) = &req.workflow_id {
                    return Err(OpError::new(ErrorKind::WorkflowNotFound, format!("Workflow not found: {id}"))
                        .with_detail(json!({ "workflowId": id })));
                }
                return Err(OpError::new(ErrorKind::StoryRequired, "story is required for new workflow"));
            }
        };

        if !req.answers.is_empty() {
            if let Some(workflow) = state.workflow_mut(&workflow_id) {
                for question in &mut workflow.questions {
                    let answer = req
                        .answers
                        .iter()
                        .find(|a| a.question_id == question.id)
                        .map(|a| a.answer.trim())
                        .filter(|a| !a.is_empty());
                    if let Some(answer) = answer {
                        question.answer = Some(answer.to_string());
                    }
                }
                workflow.updated_at = Utc::now();
            }
            events.push(
                ActivityEvent::workflow("answers_applied", format!("Applied {} answer(s)", req.answers.len()))
                    .with_workflow(Some(workflow_id.clone())),
            );
        }
        Ok(workflow_id)
    }

    /// Load roles from the first worker's repository when none are known.
    async fn ensure_roles(&self, workflow_id: &str) {
        let store = self.lifecycle.store();
        let repo = store
            .read(|s| {
                if s.agent_roles.is_empty() {
                    s.workers.first().map(|w| w.repo_path.clone())
                } else {
                    None
                }
            })
            .await;
        let Some(repo) = repo else {
            return;
        };
        let path = roles_file_path(&repo, None);
        match read_roles_file(&path).await {
            Ok(profiles) => {
                store
                    .mutate(|state, events| {
                        events.push(
                            ActivityEvent::system(
                                "load_roles_md_auto",
                                format!("loaded {} role(s) from {}", profiles.len(), path.display()),
                            )
                            .with_workflow(Some(workflow_id.to_string())),
                        );
                        for profile in profiles {
                            state.agent_roles.insert(profile.agent_id.clone(), profile);
                        }
                    })
                    .await;
            }
            Err(e) => debug!(path = %path.display(), error = %e, "no roles file to auto-load"),
        }
    }

    fn decompose_into(state: &mut AppState, events: &mut Vec<ActivityEvent>, workflow_id: &str) -> OpResult<()> {
        let Some(workflow) = state.workflow(workflow_id) else {
            return Err(OpError::new(ErrorKind::WorkflowNotFound, format!("Workflow not found: {workflow_id}")));
        };
        if workflow.is_decomposed() {
            return Ok(());
        }
        if state.agent_roles.is_empty() {
            return Err(OpError::new(ErrorKind::AgentRolesRequired, "No agent roles configured").with_detail(json!({
                "hint": "Prepare <repo>/.agent/roles.md and call loadAgentRoles",
                "workflowId": workflow_id,
            })));
        }
        let roles: Vec<AgentRoleProfile> = state.agent_roles.values().cloned().collect();
        let tasks = decompose(workflow_id, &workflow.story, &roles);
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let count = tasks.len();
        state.tasks.extend(tasks);
        if let Some(workflow) = state.workflow_mut(workflow_id) {
            workflow.task_ids = ids;
            workflow.updated_at = Utc::now();
        }
        events.push(
            ActivityEvent::workflow("tasks_decomposed", format!("Created {count} task(s)"))
                .with_workflow(Some(workflow_id.to_string())),
        );
        Ok(())
    }

    /// Claim every assigned `todo` task of the workflow for its assignee.
    async fn claim_all(&self, workflow_id: &str) {
        let store = self.lifecycle.store();
        let pending: Vec<(String, String)> = store
            .read(|s| {
                s.workflow(workflow_id)
                    .map(|w| {
                        w.task_ids
                            .iter()
                            .filter_map(|id| s.task(id))
                            .filter(|t| t.status == TaskStatus::Todo)
                            .filter_map(|t| t.assignee.clone().map(|a| (t.id.clone(), a)))
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .await;

        for (task_id, agent_id) in pending {
            if let Err(e) = self.lifecycle.claim(&task_id, &agent_id).await {
                warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "workflow claim failed");
                store
                    .log(
                        ActivityEvent::workflow("workflow_claim_failed", format!("{task_id} for {agent_id}: {}", e.kind))
                            .with_agent(agent_id)
                            .with_workflow(Some(workflow_id.to_string())),
                    )
                    .await;
            }
        }
    }

    async fn outcome(&self, workflow_id: &str) -> StoryOutcome {
        let store = self.lifecycle.store();
        let filter = ActivityFilter {
            workflow_id: Some(workflow_id.to_string()),
            ..ActivityFilter::default()
        };
        let activity_tail = store.activity(&filter, ACTIVITY_TAIL).await;
        store
            .read(|s| {
                let workflow = s.workflow(workflow_id);
                StoryOutcome {
                    workflow_id: workflow_id.to_string(),
                    status: workflow.map_or(WorkflowStatus::AwaitingUser, |w| w.status),
                    questions: workflow
                        .map(|w| w.questions.iter().filter(|q| !q.is_answered()).cloned().collect())
                        .unwrap_or_default(),
                    tasks: workflow
                        .map(|w| w.task_ids.iter().filter_map(|id| s.task(id).cloned()).collect())
                        .unwrap_or_default(),
                    report: workflow.and_then(|w| w.report.clone()),
                    activity_tail,
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{init_repo, profile, store_with, worker, worktrees};

    const FULL_STORY: &str =
        "Add a greeting. Acceptance: prints hello. Out of scope: i18n. Constraint: no new deps";

    fn lifecycle_for(store: Arc<crate::services::task_store::StateStore>) -> Arc<TaskLifecycle> {
        Arc::new(TaskLifecycle::new(store, worktrees()))
    }

    #[test]
    fn test_questions_follow_missing_cues() {
        assert_eq!(clarifying_questions("Build a login page").len(), 3);
        assert!(clarifying_questions(FULL_STORY).is_empty());
        assert_eq!(clarifying_questions("完了条件: 表示される。制約なし").len(), 1);
    }

    #[test]
    fn test_clauses_split_on_sentence_marks() {
        assert_eq!(story_clauses("a. b\nc。d"), vec!["a", "b", "c"]);
        assert!(story_clauses(" . \n").is_empty());
    }

    #[test]
    fn test_decompose_routes_by_role() {
        let roles = vec![
            profile("D1", Role::Developer),
            profile("D2", Role::Developer),
            profile("PM", Role::Pm),
            profile("QA", Role::Qa),
        ];
        let tasks = decompose("wf", "one. two. three. four", &roles);
        assert_eq!(tasks.len(), 4);
        let assignees: Vec<_> = tasks.iter().map(|t| t.assignee.clone().unwrap()).collect();
        assert_eq!(assignees, vec!["D1", "D2", "D1", "PM"]);
        assert!(tasks.iter().all(|t| t.workflow_id.as_deref() == Some("wf")));
        assert!(tasks[0].title.starts_with("[wf] Implement 1"));

        let fallback = decompose("wf", "", &[profile("QA", Role::Qa)]);
        assert_eq!(fallback.len(), 2);
        assert_eq!(fallback[0].assignee.as_deref(), Some("QA"));
        assert_eq!(fallback[1].assignee.as_deref(), Some("QA"));
    }

    #[test]
    fn test_derived_status() {
        let mut a = Task::new("a", None);
        let mut b = Task::new("b", None);
        assert_eq!(derived_status(&[&a, &b]), None);
        a.status = TaskStatus::WaitAccept;
        b.status = TaskStatus::Done;
        assert_eq!(derived_status(&[&a, &b]), Some(WorkflowStatus::Verified));
        a.status = TaskStatus::Done;
        assert_eq!(derived_status(&[&a, &b]), Some(WorkflowStatus::Reported));
        b.status = TaskStatus::Blocked;
        assert_eq!(derived_status(&[&a, &b]), Some(WorkflowStatus::Blocked));
    }

    #[tokio::test]
    async fn test_new_workflow_requires_story() {
        let service = WorkflowService::new(lifecycle_for(store_with(&[]).await));
        let err = service.run(&StoryRequest::default()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::StoryRequired);
        let err = service
            .run(&StoryRequest {
                workflow_id: Some("wf_missing".into()),
                ..StoryRequest::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::WorkflowNotFound);
    }

    #[tokio::test]
    async fn test_clarify_then_decompose_ready() {
        let service = WorkflowService::new(lifecycle_for(store_with(&[]).await));
        let first = service
            .run(&StoryRequest {
                story: Some("Add a greeting".into()),
                auto_execute: false,
                ..StoryRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(first.status, WorkflowStatus::AwaitingUser);
        assert_eq!(first.questions.len(), 3);
        assert!(first.tasks.is_empty());

        let answers = first
            .questions
            .iter()
            .map(|q| StoryAnswer {
                question_id: q.id.clone(),
                answer: "yes".into(),
            })
            .collect();
        let second = service
            .run(&StoryRequest {
                workflow_id: Some(first.workflow_id.clone()),
                answers,
                auto_execute: false,
                ..StoryRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(second.status, WorkflowStatus::Ready);
        // TL and PM are the only roles: one implementation task plus acceptance.
        assert_eq!(second.tasks.len(), 2);
        assert!(second.activity_tail.iter().any(|e| e.action == "tasks_decomposed"));
    }

    #[tokio::test]
    async fn test_roles_required_without_profiles() {
        let store = Arc::new(crate::services::task_store::StateStore::in_memory());
        let service = WorkflowService::new(lifecycle_for(store));
        let err = service
            .run(&StoryRequest {
                story: Some(FULL_STORY.into()),
                ..StoryRequest::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::AgentRolesRequired);
    }

    #[tokio::test]
    async fn test_auto_execute_claims_assigned_tasks() {
        let (_dir, repo) = init_repo();
        let store = Arc::new(crate::services::task_store::StateStore::in_memory());
        store
            .mutate(|s, _| {
                s.upsert_worker(worker("D1", &repo));
            })
            .await;
        std::fs::create_dir_all(repo.join(".agent")).unwrap();
        std::fs::write(
            repo.join(".agent/roles.md"),
            "---\nagents:\n  - agentId: D1\n    role: developer\n---\n# Roles\n",
        )
        .unwrap();
        let service = WorkflowService::new(lifecycle_for(Arc::clone(&store)));

        let outcome = service
            .run(&StoryRequest {
                story: Some(FULL_STORY.into()),
                ..StoryRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.status, WorkflowStatus::Executing);
        assert!(!outcome.tasks.is_empty());
        assert_eq!(outcome.tasks.len(), 4);
        assert!(outcome.tasks.iter().all(|t| t.status == TaskStatus::Doing));
        assert!(outcome.activity_tail.iter().any(|e| e.action == "load_roles_md_auto"));

        store
            .mutate(|s, _| {
                for t in &mut s.tasks {
                    t.status = TaskStatus::Done;
                }
            })
            .await;
        let done = service
            .run(&StoryRequest {
                workflow_id: Some(outcome.workflow_id.clone()),
                ..StoryRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(done.status, WorkflowStatus::Reported);
        assert!(done.report.unwrap().contains("done=4/4"));
    }
}
