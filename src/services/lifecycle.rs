//! Task Lifecycle Engine
//!
//! Owns the status transitions of implementation tasks: enqueue, assign,
//! claim, submit, reject, block, progress reports and the manual status
//! override. Acceptance lives in [`crate::services::acceptance`].
//!
//! Guards are evaluated twice when an operation has to suspend for git work:
//! once up front so obvious failures skip the I/O, and again under the store
//! lock right before the mutation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::domain::models::{ActivityEvent, Task, TaskStatus, TaskType, Worker};
use crate::domain::{ErrorKind, OpError, OpResult};
use crate::services::review_queue::{close_reviews, queue_review};
use crate::services::task_store::{AppState, StateStore};
use crate::services::worktree_service::{CleanupReport, PatchOutcome, WorktreeService};

/// Where `apply_patch` writes the diff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PatchTarget {
    #[default]
    Worktree,
    Repo,
}

impl PatchTarget {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "worktree" => Some(Self::Worktree),
            "repo" => Some(Self::Repo),
            _ => None,
        }
    }
}

/// Longest progress message accepted from a worker.
pub const MAX_PROGRESS_MESSAGE: usize = 500;

/// A successful claim.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimOutcome {
    pub task: Task,
    pub worktree_path: std::path::PathBuf,
    pub branch: String,
}

/// Acknowledgement of a progress report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub task_id: String,
    pub agent_id: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

fn assignee_mismatch(task: &Task, agent_id: &str) -> Option<OpError> {
    let assignee = task.assignee.as_deref()?;
    (assignee != agent_id).then(|| {
        OpError::new(
            ErrorKind::AssigneeMismatch,
            format!("Task assignee mismatch: expected {assignee}"),
        )
        .with_detail(json!({ "taskId": task.id, "assignee": assignee, "requestedBy": agent_id }))
    })
}

/// Claim guards, in order: existence, claimable status, ownership, rework
/// priority and worker registration.
fn claim_guard(state: &AppState, task_id: &str, agent_id: &str) -> OpResult<Worker> {
    let task = state.require_task(task_id)?;
    if !task.status.is_claimable() {
        return Err(OpError::invalid_state(task_id, task.status, "todo or rejected"));
    }
    if let Some(err) = assignee_mismatch(task, agent_id) {
        return Err(err);
    }
    if let Some(rework) = state.tasks.iter().find(|t| {
        t.id != task_id
            && t.status.is_claimable()
            && t.rework_requested
            && t.assignee.as_deref() == Some(agent_id)
    }) {
        return Err(OpError::new(
            ErrorKind::ReworkPriorityRequired,
            format!("Rework task {} must be claimed first", rework.id),
        )
        .with_detail(json!({
            "taskId": task_id,
            "agentId": agent_id,
            "prioritizedTaskId": rework.id,
        })));
    }
    state.require_worker(agent_id).cloned()
}

fn submit_guard(state: &AppState, task_id: &str, agent_id: &str) -> OpResult<Worker> {
    let task = state.require_task(task_id)?;
    if task.status != TaskStatus::Doing {
        return Err(OpError::invalid_state(task_id, task.status, "doing"));
    }
    if let Some(err) = assignee_mismatch(task, agent_id) {
        return Err(err);
    }
    state.require_worker(agent_id).cloned()
}

/// Move a task to `rejected` and close every review pointing at it.
pub(crate) fn apply_rejection(
    state: &mut AppState,
    events: &mut Vec<ActivityEvent>,
    task_id: &str,
    action: &str,
    reason: &str,
) -> OpResult<Task> {
    let task = state.require_task_mut(task_id)?;
    task.status = TaskStatus::Rejected;
    task.rework_requested = true;
    task.rework_count += 1;
    task.rework_reason = Some(reason.to_string());
    task.touch();
    let snapshot = task.clone();

    let closed = close_reviews(state, task_id, None);
    events.push(
        ActivityEvent::workflow(action, format!("{task_id} rejected: {reason}"))
            .with_workflow(snapshot.workflow_id.clone()),
    );
    if !closed.is_empty() {
        events.push(
            ActivityEvent::workflow("review_tasks_closed", format!("{task_id}: {}", closed.join(", ")))
                .with_workflow(snapshot.workflow_id.clone()),
        );
    }
    Ok(snapshot)
}

/// Move a task to `blocked`, recording why.
pub(crate) fn apply_block(
    state: &mut AppState,
    events: &mut Vec<ActivityEvent>,
    task_id: &str,
    reason: &str,
) -> Option<Task> {
    let task = state.task_mut(task_id)?;
    task.status = TaskStatus::Blocked;
    task.block_reason = Some(reason.to_string());
    task.touch();
    let mut event = ActivityEvent::workflow("task_blocked", format!("{task_id} blocked: {reason}"))
        .with_workflow(task.workflow_id.clone());
    if let Some(assignee) = &task.assignee {
        event = event.with_agent(assignee.clone());
    }
    events.push(event);
    Some(task.clone())
}

/// Record a submission and queue the tech lead review.
pub(crate) fn apply_submission(
    state: &mut AppState,
    events: &mut Vec<ActivityEvent>,
    task_id: &str,
    agent_id: &str,
    summary: Option<&str>,
) -> OpResult<Task> {
    let task = state.require_task_mut(task_id)?;
    task.assignee = Some(agent_id.to_string());
    task.status = TaskStatus::InReview;
    task.rework_requested = false;
    task.rework_reason = None;
    task.touch();
    let snapshot = task.clone();

    let summary = summary.map(str::trim).filter(|s| !s.is_empty());
    events.push(
        ActivityEvent::workflow(
            "task_submitted",
            match summary {
                Some(s) => format!("{task_id} submitted by {agent_id}: {s}"),
                None => format!("{task_id} submitted by {agent_id}"),
            },
        )
        .with_agent(agent_id)
        .with_workflow(snapshot.workflow_id.clone()),
    );
    queue_review(state, events, task_id, TaskType::TlReview);
    Ok(snapshot)
}

/// Check the provenance/verify gate for a task about to become final.
///
/// Tasks that never ran through the worker pipeline have no metadata and
/// pass.
pub(crate) fn done_gate(state: &AppState, task_id: &str) -> OpResult<()> {
    let Some(meta) = state.task_run_meta.get(task_id) else {
        return Ok(());
    };
    match meta.gate_error() {
        None => Ok(()),
        Some(kind) => {
            let message = match kind {
                ErrorKind::ProvenanceRequired => format!("Task {task_id} has no diff provenance"),
                _ => format!("Task {task_id} requires a passing verify run"),
            };
            Err(OpError::new(kind, message)
                .with_detail(json!({ "taskId": task_id, "meta": meta })))
        }
    }
}

/// State machine for implementation tasks.
pub struct TaskLifecycle {
    store: Arc<StateStore>,
    worktrees: Arc<WorktreeService>,
    /// Serializes claims of the same task across the git setup suspension
    claim_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TaskLifecycle {
    pub fn new(store: Arc<StateStore>, worktrees: Arc<WorktreeService>) -> Self {
        Self {
            store,
            worktrees,
            claim_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Create a `todo` implementation task.
    #[instrument(skip(self, description))]
    pub async fn enqueue(&self, title: &str, description: Option<String>, assignee: Option<String>) -> OpResult<Task> {
        let title = title.trim();
        if title.is_empty() {
            return Err(OpError::invalid_argument("title must not be empty"));
        }
        let mut task = Task::new(title, description.filter(|d| !d.trim().is_empty()));
        task.task_type = Some(TaskType::Implementation);
        task.assignee = assignee.filter(|a| !a.trim().is_empty());

        let created = task.clone();
        self.store
            .mutate(move |state, events| {
                events.push(ActivityEvent::workflow(
                    "task_enqueued",
                    format!("{} {}", task.id, task.title),
                ));
                state.tasks.push(task);
            })
            .await;
        info!(task_id = %created.id, "task enqueued");
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn assign(&self, task_id: &str, assignee: &str) -> OpResult<Task> {
        if assignee.trim().is_empty() {
            return Err(OpError::invalid_argument("assignee must not be empty"));
        }
        self.store
            .mutate(|state, events| {
                let task = state.require_task_mut(task_id)?;
                task.assignee = Some(assignee.to_string());
                task.touch();
                events.push(
                    ActivityEvent::workflow("task_assigned", format!("{task_id} -> {assignee}"))
                        .with_agent(assignee)
                        .with_workflow(task.workflow_id.clone()),
                );
                Ok(task.clone())
            })
            .await
    }

    /// Claim a task for an agent, creating its worktree when needed.
    ///
    /// Concurrent claims of one task run one at a time; the later one sees
    /// the task already `doing` and fails with `INVALID_STATE`.
    #[instrument(skip(self))]
    pub async fn claim(&self, task_id: &str, agent_id: &str) -> OpResult<ClaimOutcome> {
        let lock = Arc::clone(self.claim_locks.lock().await.entry(task_id.to_string()).or_default());
        let result = {
            let _held = lock.lock().await;
            self.claim_exclusive(task_id, agent_id).await
        };
        drop(lock);
        self.claim_locks
            .lock()
            .await
            .retain(|_, l| Arc::strong_count(l) > 1);
        result
    }

    async fn claim_exclusive(&self, task_id: &str, agent_id: &str) -> OpResult<ClaimOutcome> {
        let worker = self
            .store
            .read(|state| claim_guard(state, task_id, agent_id))
            .await?;

        let worktree = match self.worktrees.ensure(&worker, task_id).await {
            Ok((worktree, _created)) => worktree,
            Err(e) => {
                warn!(task_id, agent_id, error = %e, "worktree setup failed, blocking task");
                let reason = format!("worktree setup failed: {}", e.kind);
                self.store
                    .mutate(|state, events| {
                        // Only block a task nobody else has taken in the meantime.
                        if claim_guard(state, task_id, agent_id).is_ok() {
                            apply_block(state, events, task_id, &reason);
                        }
                    })
                    .await;
                return Err(OpError::new(
                    ErrorKind::WorktreeSetupFailed,
                    format!("Worktree setup failed for {task_id}: {}", e.message),
                )
                .with_detail(json!({
                    "taskId": task_id,
                    "agentId": agent_id,
                    "reason": e.kind.as_str(),
                    "detail": e.detail,
                })));
            }
        };

        let task = self
            .store
            .mutate(|state, events| {
                claim_guard(state, task_id, agent_id)?;
                let task = state.require_task_mut(task_id)?;
                task.assignee = Some(agent_id.to_string());
                task.status = TaskStatus::Doing;
                task.rework_requested = false;
                task.block_reason = None;
                task.touch();
                events.push(
                    ActivityEvent::workflow("task_claimed", format!("{task_id} claimed by {agent_id}"))
                        .with_agent(agent_id)
                        .with_workflow(task.workflow_id.clone()),
                );
                Ok::<_, OpError>(task.clone())
            })
            .await?;

        info!(task_id, agent_id, branch = %worktree.branch, "task claimed");
        Ok(ClaimOutcome {
            task,
            worktree_path: worktree.worktree_path,
            branch: worktree.branch,
        })
    }

    /// Submit finished work for tech lead review.
    #[instrument(skip(self, summary))]
    pub async fn submit(&self, task_id: &str, agent_id: &str, summary: Option<&str>) -> OpResult<Task> {
        let worker = self
            .store
            .read(|state| submit_guard(state, task_id, agent_id))
            .await?;

        if let Err(e) = self.worktrees.validate(&worker, task_id).await {
            return Err(OpError::new(
                ErrorKind::WorktreeRequired,
                format!("task worktree is required for submit: {task_id}"),
            )
            .with_detail(json!({
                "taskId": task_id,
                "agentId": agent_id,
                "reason": e.kind.as_str(),
                "detail": e.detail,
            })));
        }

        self.store
            .mutate(|state, events| {
                submit_guard(state, task_id, agent_id)?;
                apply_submission(state, events, task_id, agent_id, summary)
            })
            .await
    }

    /// Send a task under review back for rework.
    #[instrument(skip(self))]
    pub async fn reject(&self, task_id: &str, reason: &str) -> OpResult<Task> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(OpError::invalid_argument("reason must not be empty"));
        }
        self.store
            .mutate(|state, events| {
                let task = state.require_task(task_id)?;
                if !task.status.is_review_stage() {
                    return Err(OpError::invalid_state(
                        task_id,
                        task.status,
                        "in_review, wait_accept or accepted",
                    ));
                }
                apply_rejection(state, events, task_id, "planning_reject_task", reason)
            })
            .await
    }

    /// Mark a task blocked. Unknown ids are ignored.
    pub async fn block(&self, task_id: &str, reason: &str) -> Option<Task> {
        self.store
            .mutate(|state, events| apply_block(state, events, task_id, reason))
            .await
    }

    /// Manual status override.
    ///
    /// `done` is only reachable from `wait_accept`. Both `done` and
    /// `accepted` must pass the provenance/verify gate when the task has run
    /// metadata.
    #[instrument(skip(self))]
    pub async fn set_status(&self, task_id: &str, status: TaskStatus) -> OpResult<Task> {
        self.store
            .mutate(|state, events| {
                let from = state.require_task(task_id)?.status;
                if status == TaskStatus::Done && from != TaskStatus::WaitAccept {
                    return Err(OpError::new(
                        ErrorKind::InvalidTransition,
                        format!("Task {task_id} cannot move from {from} to done"),
                    )
                    .with_detail(json!({ "taskId": task_id, "from": from, "to": status })));
                }
                if matches!(status, TaskStatus::Done | TaskStatus::Accepted) {
                    done_gate(state, task_id)?;
                }

                let task = state.require_task_mut(task_id)?;
                task.status = status;
                if status != TaskStatus::Blocked {
                    task.block_reason = None;
                }
                task.touch();
                events.push(
                    ActivityEvent::workflow("task_status_set", format!("{task_id} {from} -> {status}"))
                        .with_workflow(task.workflow_id.clone()),
                );
                Ok(task.clone())
            })
            .await
    }

    /// Heartbeat-style progress note from the assigned worker.
    #[instrument(skip(self, message))]
    pub async fn report_progress(&self, task_id: &str, agent_id: &str, message: &str) -> OpResult<ProgressReport> {
        self.store
            .mutate(|state, events| {
                let task = state.require_task(task_id)?;
                if task.status != TaskStatus::Doing {
                    return Err(OpError::invalid_state(task_id, task.status, "doing"));
                }
                if let Some(err) = assignee_mismatch(task, agent_id) {
                    return Err(err);
                }
                let message = message.trim();
                if message.is_empty() || message.chars().count() > MAX_PROGRESS_MESSAGE {
                    return Err(OpError::new(
                        ErrorKind::InvalidMessage,
                        format!("message must be 1..={MAX_PROGRESS_MESSAGE} characters"),
                    )
                    .with_detail(json!({ "taskId": task_id })));
                }

                let task = state.require_task_mut(task_id)?;
                task.touch();
                events.push(
                    ActivityEvent::agent("worker_progress_reported", format!("{task_id} {message}"))
                        .with_agent(agent_id)
                        .with_workflow(task.workflow_id.clone()),
                );
                Ok(ProgressReport {
                    task_id: task_id.to_string(),
                    agent_id: agent_id.to_string(),
                    message: message.to_string(),
                    timestamp: task.updated_at,
                })
            })
            .await
    }

    /// Apply a unified diff to the task worktree or the worker's repository.
    #[instrument(skip(self, patch))]
    pub async fn apply_patch(
        &self,
        agent_id: &str,
        task_id: &str,
        patch: &str,
        target: PatchTarget,
    ) -> OpResult<PatchOutcome> {
        let worker = self.store.read(|s| s.require_worker(agent_id).cloned()).await?;
        let dir = match target {
            PatchTarget::Repo => worker.repo_path.clone(),
            PatchTarget::Worktree => self.worktrees.validate(&worker, task_id).await?.worktree_path,
        };
        let outcome = self.worktrees.apply_patch(&dir, patch).await?;
        let workflow_id = self.store.read(|s| s.task(task_id).and_then(|t| t.workflow_id.clone())).await;
        self.store
            .log(
                ActivityEvent::agent(
                    "patch_applied",
                    format!("{task_id} ok={} dir={}", outcome.ok, dir.display()),
                )
                .with_agent(agent_id)
                .with_workflow(workflow_id),
            )
            .await;
        Ok(outcome)
    }

    /// Remove a task worktree, archiving its state first when asked.
    #[instrument(skip(self))]
    pub async fn cleanup_worktree(
        &self,
        agent_id: &str,
        task_id: &str,
        force: bool,
        delete_branch: bool,
        archive_before_force: bool,
    ) -> OpResult<CleanupReport> {
        let worker = self.store.read(|s| s.require_worker(agent_id).cloned()).await?;
        let report = self
            .worktrees
            .cleanup(&worker, task_id, force, delete_branch, archive_before_force)
            .await;
        if let Some(warning) = &report.warning {
            warn!(task_id, agent_id, "{warning}");
        }

        self.store
            .mutate(|_, events| {
                if let Some(archive) = &report.archive {
                    events.push(
                        ActivityEvent::system(
                            "cleanup_archive_created",
                            format!("{task_id} archived to {}", archive.diff_path.display()),
                        )
                        .with_agent(agent_id),
                    );
                }
                events.push(
                    ActivityEvent::system(
                        "cleanup_complete",
                        format!("{task_id} removed={} force={force}", report.ok),
                    )
                    .with_agent(agent_id),
                );
            })
            .await;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TaskRunMeta;
    use crate::services::test_support::{init_repo, store_with, worker, worktrees};
    use crate::services::worktree_service::worktree_path;

    async fn fixture() -> (tempfile::TempDir, TaskLifecycle, Worker) {
        let (dir, repo) = init_repo();
        let w1 = worker("W1", &repo);
        let store = store_with(&[w1.clone()]).await;
        (dir, TaskLifecycle::new(store, worktrees()), w1)
    }

    async fn insert(lifecycle: &TaskLifecycle, task: Task) {
        lifecycle.store().mutate(|s, _| s.tasks.push(task)).await;
    }

    fn meta(task_id: &str, provenance_ok: bool, verified: bool) -> TaskRunMeta {
        TaskRunMeta {
            task_id: task_id.into(),
            agent_id: "W1".into(),
            worktree_path: "/tmp/wt".into(),
            branch: "agent/W1/x".into(),
            base_branch: "main".into(),
            diff_length: 0,
            provenance_ok,
            verify_required: true,
            verify_command_key: Some("test".into()),
            verified,
            last_run_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_claim_creates_worktree_and_submit_queues_review() {
        let (_dir, lifecycle, w1) = fixture().await;
        let task = lifecycle.enqueue("T", None, None).await.unwrap();

        let claimed = lifecycle.claim(&task.id, "W1").await.unwrap();
        assert_eq!(claimed.task.status, TaskStatus::Doing);
        assert_eq!(claimed.task.assignee.as_deref(), Some("W1"));
        assert_eq!(claimed.worktree_path, worktree_path(&w1, &task.id));
        assert!(claimed.worktree_path.join("README.md").exists());

        let submitted = lifecycle.submit(&task.id, "W1", Some(" done ")).await.unwrap();
        assert_eq!(submitted.status, TaskStatus::InReview);

        let reviews = lifecycle
            .store()
            .read(|s| {
                s.tasks
                    .iter()
                    .filter(|t| t.task_type == Some(TaskType::TlReview))
                    .map(|t| t.assignee.clone())
                    .collect::<Vec<_>>()
            })
            .await;
        assert_eq!(reviews, vec![Some("TL".to_string())]);
    }

    #[tokio::test]
    async fn test_claim_guards() {
        let (_dir, lifecycle, _) = fixture().await;
        let mut other = Task::with_id("other", "owned", None);
        other.assignee = Some("W2".into());
        insert(&lifecycle, other).await;
        let err = lifecycle.claim("other", "W1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AssigneeMismatch);
        assert_eq!(err.detail["assignee"], "W2");

        assert_eq!(
            lifecycle.claim("missing", "W1").await.unwrap_err().kind,
            ErrorKind::TaskNotFound
        );

        let task = lifecycle.enqueue("free", None, None).await.unwrap();
        assert_eq!(
            lifecycle.claim(&task.id, "ghost").await.unwrap_err().kind,
            ErrorKind::WorkerNotFound
        );

        lifecycle.claim(&task.id, "W1").await.unwrap();
        let err = lifecycle.claim(&task.id, "W1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_concurrent_claims_pick_one_winner() {
        let (_dir, lifecycle, w1) = fixture().await;
        let task = lifecycle.enqueue("T", None, None).await.unwrap();

        let (a, b) = tokio::join!(lifecycle.claim(&task.id, "W1"), lifecycle.claim(&task.id, "W1"));
        let (won, lost) = match (a, b) {
            (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
            (a, b) => panic!("expected exactly one winner: {a:?} / {b:?}"),
        };
        assert_eq!(won.task.status, TaskStatus::Doing);
        assert_eq!(won.worktree_path, worktree_path(&w1, &task.id));
        assert_eq!(lost.kind, ErrorKind::InvalidState);

        let stored = lifecycle
            .store()
            .read(|s| s.task(&task.id).map(|t| (t.status, t.block_reason.clone())))
            .await;
        assert_eq!(stored, Some((TaskStatus::Doing, None)));
        assert!(lifecycle.claim_locks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_rework_must_be_claimed_first() {
        let (_dir, lifecycle, _) = fixture().await;
        let mut rework = Task::with_id("T1", "rework", None);
        rework.assignee = Some("W1".into());
        rework.rework_requested = true;
        insert(&lifecycle, rework).await;
        insert(&lifecycle, Task::with_id("T2", "fresh", None)).await;

        let err = lifecycle.claim("T2", "W1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ReworkPriorityRequired);
        assert_eq!(err.detail["prioritizedTaskId"], "T1");

        lifecycle.claim("T1", "W1").await.unwrap();
    }

    #[tokio::test]
    async fn test_worktree_setup_failure_blocks_task() {
        let dir = tempfile::TempDir::new().unwrap();
        let not_a_repo = dir.path().join("plain");
        std::fs::create_dir_all(&not_a_repo).unwrap();
        let store = store_with(&[worker("W1", &not_a_repo)]).await;
        let lifecycle = TaskLifecycle::new(store, worktrees());
        let task = lifecycle.enqueue("T", None, None).await.unwrap();

        let err = lifecycle.claim(&task.id, "W1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::WorktreeSetupFailed);
        assert_eq!(err.detail["reason"], "WORKTREE_LIST_FAILED");
        let status = lifecycle.store().read(|s| s.task(&task.id).map(|t| t.status)).await;
        assert_eq!(status, Some(TaskStatus::Blocked));
    }

    #[tokio::test]
    async fn test_submit_requires_worktree() {
        let (_dir, lifecycle, _) = fixture().await;
        let mut task = Task::with_id("T", "no worktree", None);
        task.status = TaskStatus::Doing;
        task.assignee = Some("W1".into());
        insert(&lifecycle, task).await;

        let err = lifecycle.submit("T", "W1", None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::WorktreeRequired);
        assert_eq!(err.detail["reason"], "WORKTREE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_reject_counts_rework_and_closes_reviews() {
        let (_dir, lifecycle, _) = fixture().await;
        let mut task = Task::with_id("T", "target", None);
        task.status = TaskStatus::WaitAccept;
        task.assignee = Some("W1".into());
        insert(&lifecycle, task).await;
        let mut review = Task::with_id("R", "[TL Review] target", None);
        review.task_type = Some(TaskType::TlReview);
        review.review_target_task_id = Some("T".into());
        insert(&lifecycle, review).await;

        let rejected = lifecycle.reject("T", "missing tests").await.unwrap();
        assert_eq!(rejected.status, TaskStatus::Rejected);
        assert_eq!(rejected.rework_count, 1);
        assert!(rejected.rework_requested);
        assert_eq!(rejected.rework_reason.as_deref(), Some("missing tests"));
        let review_status = lifecycle.store().read(|s| s.task("R").map(|t| t.status)).await;
        assert_eq!(review_status, Some(TaskStatus::Done));

        let err = lifecycle.reject("T", "again").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_set_status_done_requires_wait_accept_and_gate() {
        let (_dir, lifecycle, _) = fixture().await;
        insert(&lifecycle, Task::with_id("T", "manual", None)).await;

        let err = lifecycle.set_status("T", TaskStatus::Done).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidTransition);
        assert_eq!(err.detail["from"], "todo");

        lifecycle.set_status("T", TaskStatus::WaitAccept).await.unwrap();
        lifecycle
            .store()
            .mutate(|s, _| s.task_run_meta.insert("T".into(), meta("T", false, false)))
            .await;
        let err = lifecycle.set_status("T", TaskStatus::Done).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProvenanceRequired);

        lifecycle
            .store()
            .mutate(|s, _| s.task_run_meta.insert("T".into(), meta("T", true, false)))
            .await;
        let err = lifecycle.set_status("T", TaskStatus::Done).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::VerifyRequired);

        lifecycle
            .store()
            .mutate(|s, _| s.task_run_meta.insert("T".into(), meta("T", true, true)))
            .await;
        let done = lifecycle.set_status("T", TaskStatus::Done).await.unwrap();
        assert_eq!(done.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_report_progress_guards() {
        let (_dir, lifecycle, _) = fixture().await;
        let mut task = Task::with_id("T", "progress", None);
        task.assignee = Some("W1".into());
        insert(&lifecycle, task).await;

        let err = lifecycle.report_progress("T", "W1", "hi").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);

        lifecycle.set_status("T", TaskStatus::Doing).await.unwrap();
        let err = lifecycle.report_progress("T", "W2", "hi").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AssigneeMismatch);
        let err = lifecycle.report_progress("T", "W1", "   ").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidMessage);
        let long = "x".repeat(MAX_PROGRESS_MESSAGE + 1);
        let err = lifecycle.report_progress("T", "W1", &long).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidMessage);

        let ack = lifecycle.report_progress("T", "W1", " halfway ").await.unwrap();
        assert_eq!(ack.message, "halfway");
        let last = lifecycle
            .store()
            .read(|s| s.activity_log.back().map(|e| (e.action.clone(), e.detail.clone())))
            .await;
        assert_eq!(
            last,
            Some(("worker_progress_reported".to_string(), "T halfway".to_string()))
        );
    }

    #[tokio::test]
    async fn test_assign_and_enqueue_validation() {
        let (_dir, lifecycle, _) = fixture().await;
        assert_eq!(
            lifecycle.enqueue("  ", None, None).await.unwrap_err().kind,
            ErrorKind::InvalidArgument
        );
        let task = lifecycle.enqueue("T", None, Some("W1".into())).await.unwrap();
        assert_eq!(task.assignee.as_deref(), Some("W1"));
        let assigned = lifecycle.assign(&task.id, "W2").await.unwrap();
        assert_eq!(assigned.assignee.as_deref(), Some("W2"));
        assert_eq!(
            lifecycle.assign("missing", "W2").await.unwrap_err().kind,
            ErrorKind::TaskNotFound
        );
    }

    #[tokio::test]
    async fn test_apply_patch_and_cleanup_worktree() {
        let (_dir, lifecycle, w1) = fixture().await;
        insert(&lifecycle, Task::with_id("T", "T", None)).await;
        lifecycle.claim("T", "W1").await.unwrap();

        let patch = "--- a/README.md\n+++ b/README.md\n@@ -1 +1,2 @@\n hello\n+patched\n";
        let applied = lifecycle.apply_patch("W1", "T", patch, PatchTarget::Worktree).await.unwrap();
        assert!(applied.ok, "{:?}", applied.apply);
        assert!(applied.status.stdout.contains("README.md"));
        let path = worktree_path(&w1, "T");
        assert!(!path.join(".mcp_patch.diff").exists());

        let report = lifecycle.cleanup_worktree("W1", "T", true, true, true).await.unwrap();
        assert!(report.ok);
        assert!(report.archive.is_some());
        assert!(!path.exists());
        let actions: Vec<String> = lifecycle
            .store()
            .read(|s| s.activity_log.iter().map(|e| e.action.clone()).collect())
            .await;
        assert!(actions.iter().any(|a| a == "patch_applied"));
        assert!(actions.iter().any(|a| a == "cleanup_archive_created"));
        assert!(actions.iter().any(|a| a == "cleanup_complete"));
    }

    #[tokio::test]
    async fn test_apply_patch_requires_worker() {
        let (_dir, lifecycle, _) = fixture().await;
        let err = lifecycle.apply_patch("nobody", "T", "", PatchTarget::Repo).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::WorkerNotFound);
    }
}
