//! Acceptance & Integration Engine
//!
//! `accept` is stage dependent:
//!
//! | from          | to            | event                   | review routing                 |
//! |---------------|---------------|-------------------------|--------------------------------|
//! | `in_review`   | `wait_accept` | `techlead_accept_task`  | close tl_review, queue pm_review |
//! | `wait_accept` | `accepted`    | `planning_accept_task`  | close pm_review, queue tl_merge  |
//! | `accepted`    | `done`        | `task_done`             | close tl_merge                 |
//!
//! The last stage cherry-picks the task commit onto the integration branch.
//! Any failure leaves the task `accepted` so the call can be retried once a
//! human has fixed the repository.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, instrument};

use crate::domain::models::{ActivityEvent, Task, TaskStatus, TaskType};
use crate::domain::{ErrorKind, OpError, OpResult};
use crate::services::lifecycle::done_gate;
use crate::services::review_queue::{close_reviews, queue_review};
use crate::services::task_store::StateStore;
use crate::services::worktree_service::{Integration, WorktreeService};

/// Result of one acceptance step.
#[derive(Debug, Clone)]
pub struct AcceptOutcome {
    pub task: Task,
    /// Set only by the final stage
    pub integration: Option<Integration>,
}

impl AcceptOutcome {
    pub fn integration_json(&self) -> Value {
        self.integration
            .as_ref()
            .map_or_else(|| json!({ "enabled": false, "status": "skipped" }), Integration::to_json)
    }

    pub fn to_json(&self) -> Value {
        json!({ "ok": true, "task": self.task, "integration": self.integration_json() })
    }
}

impl Serialize for AcceptOutcome {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

pub struct AcceptanceEngine {
    store: Arc<StateStore>,
    worktrees: Arc<WorktreeService>,
    target_branch: String,
}

impl AcceptanceEngine {
    pub fn new(store: Arc<StateStore>, worktrees: Arc<WorktreeService>, target_branch: impl Into<String>) -> Self {
        Self {
            store,
            worktrees,
            target_branch: target_branch.into(),
        }
    }

    pub fn target_branch(&self) -> &str {
        &self.target_branch
    }

    /// Advance a task one acceptance stage.
    #[instrument(skip(self))]
    pub async fn accept(&self, task_id: &str) -> OpResult<AcceptOutcome> {
        let staged = self
            .store
            .mutate(|state, events| {
                let task = state.require_task(task_id)?;
                let (next, action, close, queue) = match task.status {
                    TaskStatus::InReview => (
                        TaskStatus::WaitAccept,
                        "techlead_accept_task",
                        TaskType::TlReview,
                        TaskType::PmReview,
                    ),
                    TaskStatus::WaitAccept => (
                        TaskStatus::Accepted,
                        "planning_accept_task",
                        TaskType::PmReview,
                        TaskType::TlMerge,
                    ),
                    TaskStatus::Accepted => {
                        done_gate(state, task_id)?;
                        return Ok(None);
                    }
                    other => {
                        return Err(OpError::invalid_state(
                            task_id,
                            other,
                            "in_review, wait_accept or accepted",
                        ))
                    }
                };
                if next == TaskStatus::Accepted {
                    done_gate(state, task_id)?;
                }

                let from = task.status;
                let task = state.require_task_mut(task_id)?;
                task.status = next;
                task.touch();
                let snapshot = task.clone();
                events.push(
                    ActivityEvent::workflow(action, format!("{task_id} accepted in {from} -> {next}"))
                        .with_workflow(snapshot.workflow_id.clone()),
                );
                close_reviews(state, task_id, Some(close));
                queue_review(state, events, task_id, queue);
                Ok(Some(snapshot))
            })
            .await?;

        if let Some(task) = staged {
            info!(task_id, status = %task.status, "acceptance stage advanced");
            return Ok(AcceptOutcome {
                task,
                integration: None,
            });
        }
        self.integrate(task_id).await
    }

    async fn integrate(&self, task_id: &str) -> OpResult<AcceptOutcome> {
        let (assignee, worker) = self
            .store
            .read(|state| {
                let task = state.task(task_id);
                let assignee = task.and_then(|t| t.assignee.clone());
                let worker = assignee.as_deref().and_then(|a| state.worker(a).cloned());
                (assignee, worker)
            })
            .await;

        let integration = match (&assignee, worker) {
            (None, _) => Integration::Conflict {
                reason: "task assignee is required for auto integration".to_string(),
                detail: Value::Null,
            },
            (Some(agent), None) => Integration::Conflict {
                reason: format!("worker not found: {agent}"),
                detail: Value::Null,
            },
            (Some(_), Some(worker)) => {
                self.worktrees
                    .integrate(&worker, task_id, &self.target_branch)
                    .await
            }
        };

        self.store
            .mutate(|state, events| {
                let task = state.require_task(task_id)?;
                if task.status != TaskStatus::Accepted {
                    return Err(OpError::invalid_state(task_id, task.status, "accepted"));
                }
                let workflow_id = task.workflow_id.clone();
                let agent = assignee.clone().unwrap_or_default();

                let (target_branch, commit, verb) = match &integration {
                    Integration::Conflict { reason, detail } => {
                        error!(task_id, reason, "auto integration failed");
                        events.push(
                            ActivityEvent::workflow(
                                "task_auto_integrate_failed",
                                format!("{task_id} failed: {reason}"),
                            )
                            .with_agent(agent)
                            .with_workflow(workflow_id),
                        );
                        return Err(OpError::new(
                            ErrorKind::AutoIntegrateFailed,
                            format!("Auto integration failed for {task_id}: {reason}"),
                        )
                        .with_detail(json!({ "taskId": task_id, "reason": reason, "detail": detail })));
                    }
                    Integration::Applied { target_branch, commit } => (target_branch, commit, "integrated into"),
                    Integration::AlreadyApplied { target_branch, commit } => (target_branch, commit, "already on"),
                };
                events.push(
                    ActivityEvent::workflow(
                        "task_auto_integrated",
                        format!("{task_id} {verb} {target_branch} (commit={commit})"),
                    )
                    .with_agent(agent)
                    .with_workflow(workflow_id.clone()),
                );

                let task = state.require_task_mut(task_id)?;
                task.status = TaskStatus::Done;
                task.touch();
                let snapshot = task.clone();
                events.push(
                    ActivityEvent::workflow("task_done", format!("{task_id} accepted -> merged -> done"))
                        .with_workflow(workflow_id),
                );
                close_reviews(state, task_id, Some(TaskType::TlMerge));
                Ok(snapshot)
            })
            .await
            .map(|task| AcceptOutcome {
                task,
                integration: Some(integration.clone()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::lifecycle::TaskLifecycle;
    use crate::services::test_support::{git, init_repo, store_with, worker, worktrees};

    struct Fixture {
        _dir: tempfile::TempDir,
        repo: std::path::PathBuf,
        lifecycle: TaskLifecycle,
        engine: AcceptanceEngine,
    }

    async fn fixture() -> Fixture {
        let (dir, repo) = init_repo();
        let store = store_with(&[worker("W1", &repo)]).await;
        let wt = worktrees();
        Fixture {
            _dir: dir,
            repo,
            lifecycle: TaskLifecycle::new(Arc::clone(&store), Arc::clone(&wt)),
            engine: AcceptanceEngine::new(store, wt, "main"),
        }
    }

    async fn claimed_with_change(f: &Fixture) -> String {
        let task = f.lifecycle.enqueue("T", None, None).await.unwrap();
        let claim = f.lifecycle.claim(&task.id, "W1").await.unwrap();
        std::fs::write(claim.worktree_path.join("feature.txt"), "new\n").unwrap();
        f.lifecycle.submit(&task.id, "W1", None).await.unwrap();
        task.id
    }

    #[tokio::test]
    async fn test_full_acceptance_pipeline_integrates() {
        let f = fixture().await;
        let id = claimed_with_change(&f).await;

        let tl = f.engine.accept(&id).await.unwrap();
        assert_eq!(tl.task.status, TaskStatus::WaitAccept);
        assert_eq!(tl.integration_json()["status"], "skipped");

        let pm = f.engine.accept(&id).await.unwrap();
        assert_eq!(pm.task.status, TaskStatus::Accepted);

        let done = f.engine.accept(&id).await.unwrap();
        assert_eq!(done.task.status, TaskStatus::Done);
        assert!(matches!(done.integration, Some(Integration::Applied { .. })));
        assert!(f.repo.join("feature.txt").exists());

        let store = f.lifecycle.store();
        let (actions, open_reviews) = store
            .read(|s| {
                (
                    s.activity_log.iter().map(|e| e.action.clone()).collect::<Vec<_>>(),
                    s.tasks
                        .iter()
                        .filter(|t| t.is_review_task() && t.status != TaskStatus::Done)
                        .count(),
                )
            })
            .await;
        for action in [
            "tl_review_queued",
            "techlead_accept_task",
            "pm_review_queued",
            "planning_accept_task",
            "tl_merge_queued",
            "task_auto_integrated",
            "task_done",
        ] {
            assert!(actions.iter().any(|a| a == action), "missing {action}");
        }
        assert_eq!(open_reviews, 0);
    }

    #[tokio::test]
    async fn test_final_stage_is_idempotent() {
        let f = fixture().await;
        let id = claimed_with_change(&f).await;
        f.engine.accept(&id).await.unwrap();
        f.engine.accept(&id).await.unwrap();

        // Integrate once, then roll the task back to accepted and retry.
        f.engine.accept(&id).await.unwrap();
        let head = git(&f.repo, &["rev-parse", "HEAD"]);
        f.lifecycle
            .store()
            .mutate(|s, _| {
                if let Some(t) = s.task_mut(&id) {
                    t.status = TaskStatus::Accepted;
                }
            })
            .await;
        let again = f.engine.accept(&id).await.unwrap();
        assert!(matches!(again.integration, Some(Integration::AlreadyApplied { .. })));
        assert_eq!(again.integration_json()["status"], "already_applied");
        assert_eq!(git(&f.repo, &["rev-parse", "HEAD"]), head);
    }

    #[tokio::test]
    async fn test_dirty_target_keeps_task_accepted() {
        let f = fixture().await;
        let id = claimed_with_change(&f).await;
        f.engine.accept(&id).await.unwrap();
        f.engine.accept(&id).await.unwrap();

        std::fs::write(f.repo.join("README.md"), "local edit\n").unwrap();
        let err = f.engine.accept(&id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AutoIntegrateFailed);
        assert_eq!(err.detail["reason"], "target branch has local tracked changes");
        let status = f.lifecycle.store().read(|s| s.task(&id).map(|t| t.status)).await;
        assert_eq!(status, Some(TaskStatus::Accepted));
    }

    #[tokio::test]
    async fn test_wrong_target_branch_fails() {
        let f = fixture().await;
        let id = claimed_with_change(&f).await;
        let engine = AcceptanceEngine::new(Arc::clone(f.lifecycle.store()), worktrees(), "release");
        engine.accept(&id).await.unwrap();
        engine.accept(&id).await.unwrap();
        let err = engine.accept(&id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AutoIntegrateFailed);
        assert_eq!(err.detail["reason"], "target repo is on main, expected release");
    }

    #[tokio::test]
    async fn test_accept_rejects_other_states() {
        let f = fixture().await;
        let task = f.lifecycle.enqueue("T", None, None).await.unwrap();
        let err = f.engine.accept(&task.id).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        assert_eq!(
            f.engine.accept("missing").await.unwrap_err().kind,
            ErrorKind::TaskNotFound
        );
    }
}
