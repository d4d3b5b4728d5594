//! Auto-execute loop.
//!
//! A periodic scan offers every actionable task to a [`TaskScheduler`]
//! keyed by task id. Dequeuing marks the task in progress, so a task is
//! never processed twice at once, and a task is only offered again once its
//! `(status, updatedAt)` token has moved on.
//!
//! `doing` tasks run the assignee's agent command with an implementation
//! prompt. Tasks in an acceptance stage run the routed reviewer's agent
//! command with a review prompt; a reviewer that leaves the task where it
//! was is treated as a rejection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::domain::models::{
    ActivityEvent, CommandResult, Role, Task, TaskRunMeta, TaskStatus, TaskType, Worker,
};
use crate::services::acceptance::AcceptanceEngine;
use crate::services::daemon::DaemonHandle;
use crate::services::lifecycle::{apply_block, apply_rejection, apply_submission};
use crate::services::run_service::{with_heartbeat, RunService, DEFAULT_VERIFY_KEY};
use crate::services::task_store::StateStore;
use crate::services::worktree_service::{worktree_path, WorktreeService};

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub interval: Duration,
    pub command_timeout: Duration,
    pub heartbeat: Duration,
    pub auto_verify: bool,
    pub auto_accept: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5_000),
            command_timeout: Duration::from_millis(1_200_000),
            heartbeat: Duration::from_millis(10_000),
            auto_verify: false,
            auto_accept: false,
        }
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    queue: VecDeque<String>,
    /// Token each queued task was offered with
    queued: HashMap<String, String>,
    in_progress: HashSet<String>,
    /// Token of the last dispatch per task
    dispatched: HashMap<String, String>,
}

/// Work queue with at most one pending or running entry per task.
#[derive(Debug, Default)]
pub struct TaskScheduler {
    inner: Mutex<SchedulerState>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task unless it is queued, running or was already dispatched
    /// with the same token.
    pub async fn offer(&self, task_id: &str, token: &str) -> bool {
        let mut s = self.inner.lock().await;
        if s.queued.contains_key(task_id) || s.in_progress.contains(task_id) {
            return false;
        }
        if s.dispatched.get(task_id).is_some_and(|t| t == token) {
            return false;
        }
        s.queued.insert(task_id.to_string(), token.to_string());
        s.queue.push_back(task_id.to_string());
        true
    }

    /// Pop the next task and mark it in progress.
    pub async fn next(&self) -> Option<String> {
        let mut s = self.inner.lock().await;
        let task_id = s.queue.pop_front()?;
        if let Some(token) = s.queued.remove(&task_id) {
            s.dispatched.insert(task_id.clone(), token);
        }
        s.in_progress.insert(task_id.clone());
        Some(task_id)
    }

    pub async fn finish(&self, task_id: &str) {
        self.inner.lock().await.in_progress.remove(task_id);
    }

    pub async fn is_in_progress(&self, task_id: &str) -> bool {
        self.inner.lock().await.in_progress.contains(task_id)
    }

    pub async fn pending(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

/// Prompt for the implementation stage.
pub fn implementation_prompt(task: &Task) -> String {
    let mut lines = vec![
        "You are a software worker agent running inside an assigned git worktree.".to_string(),
        "Implement the requested task directly in the repository with minimal, safe changes.".to_string(),
        "Run local checks as needed and keep the change scope focused.".to_string(),
        String::new(),
        format!("Task ID: {}", task.id),
        format!("Title: {}", task.title),
        format!("Description: {}", task.description.as_deref().unwrap_or("(none)")),
    ];
    if let Some(reason) = task.rework_reason.as_deref().filter(|_| task.rework_count > 0) {
        lines.push(format!("Rework requested: {reason}"));
    }
    lines.join("\n")
}

/// Prompt for an acceptance stage reviewer.
pub fn review_prompt(task: &Task, role: Role, worktree: Option<&Path>) -> String {
    let stage = match task.status {
        TaskStatus::InReview => "tech lead review",
        TaskStatus::WaitAccept => "product acceptance",
        _ => "merge",
    };
    let mut lines = vec![
        format!("You are the {} responsible for the {stage} of task {}.", role.as_str(), task.id),
        "Inspect the change and decide. You must call exactly one tool:".to_string(),
        format!("- acceptTask with {{\"taskId\": \"{}\"}} to approve", task.id),
        format!(
            "- rejectTask with {{\"taskId\": \"{}\", \"reason\": \"...\"}} to request rework",
            task.id
        ),
        String::new(),
        format!("Title: {}", task.title),
        format!("Description: {}", task.description.as_deref().unwrap_or("(none)")),
    ];
    if let Some(path) = worktree {
        lines.push(format!("Worktree: {}", path.display()));
    }
    lines.join("\n")
}

enum VerifyOutcome {
    Skipped,
    Passed(String),
    Failed(String),
    SetupFailed(String),
}

pub struct ExecutionLoop {
    store: Arc<StateStore>,
    runs: Arc<RunService>,
    worktrees: Arc<WorktreeService>,
    acceptance: Arc<AcceptanceEngine>,
    scheduler: TaskScheduler,
    config: ExecutionConfig,
}

impl ExecutionLoop {
    pub fn new(
        store: Arc<StateStore>,
        runs: Arc<RunService>,
        worktrees: Arc<WorktreeService>,
        acceptance: Arc<AcceptanceEngine>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            store,
            runs,
            worktrees,
            acceptance,
            scheduler: TaskScheduler::new(),
            config,
        }
    }

    /// Offer every actionable task to the scheduler. Returns how many were
    /// queued.
    pub async fn scan(&self) -> usize {
        let candidates: Vec<(String, String)> = self
            .store
            .read(|s| {
                s.tasks
                    .iter()
                    .filter(|t| t.kind() == TaskType::Implementation)
                    .filter(|t| match t.status {
                        TaskStatus::Doing => t.assignee.is_some(),
                        status => status.is_review_stage(),
                    })
                    .map(|t| (t.id.clone(), t.execution_token()))
                    .collect()
            })
            .await;
        let mut queued = 0;
        for (task_id, token) in candidates {
            if self.scheduler.offer(&task_id, &token).await {
                queued += 1;
            }
        }
        queued
    }

    /// Process queued tasks one after another.
    pub async fn run_pending(&self) -> usize {
        let mut processed = 0;
        while let Some(task_id) = self.scheduler.next().await {
            self.process(&task_id).await;
            self.scheduler.finish(&task_id).await;
            processed += 1;
        }
        processed
    }

    /// Hand each queued task to its own tokio task.
    async fn dispatch(self: &Arc<Self>) {
        while let Some(task_id) = self.scheduler.next().await {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.process(&task_id).await;
                this.scheduler.finish(&task_id).await;
            });
        }
    }

    pub async fn spawn(self) -> DaemonHandle {
        let this = Arc::new(self);
        let c = &this.config;
        this.store
            .log(ActivityEvent::system(
                "worker_execution_loop_started",
                format!(
                    "intervalMs={}, timeoutMs={}, autoVerify={}, autoAccept={}",
                    c.interval.as_millis(),
                    c.command_timeout.as_millis(),
                    c.auto_verify,
                    c.auto_accept
                ),
            ))
            .await;
        info!(interval = ?c.interval, auto_verify = c.auto_verify, auto_accept = c.auto_accept, "auto-execute loop started");

        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop_flag);
        let join = tokio::spawn(async move {
            let mut timer = interval(this.config.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }
                this.scan().await;
                this.dispatch().await;
            }
            debug!("auto-execute loop stopped");
        });
        DaemonHandle::new(stop_flag, join)
    }

    #[instrument(skip(self))]
    async fn process(&self, task_id: &str) {
        let Some(task) = self.store.read(|s| s.task(task_id).cloned()).await else {
            return;
        };
        match task.status {
            TaskStatus::Doing => self.execute_implementation(&task).await,
            status if status.is_review_stage() => self.execute_review(&task).await,
            _ => debug!(status = %task.status, "task moved on before processing"),
        }
    }

    fn agent_event(task: &Task, agent_id: &str, action: &str, detail: impl Into<String>) -> ActivityEvent {
        ActivityEvent::agent(action, detail)
            .with_agent(agent_id)
            .with_workflow(task.workflow_id.clone())
    }

    async fn block(&self, task_id: &str, reason: &str) {
        warn!(task_id, reason, "blocking task");
        self.store
            .mutate(|state, events| apply_block(state, events, task_id, reason))
            .await;
    }

    async fn run_with_heartbeat(&self, task: &Task, agent_id: &str, worker: &Worker, prompt: &str, dir: &Path) -> CommandResult {
        let run = self
            .runs
            .run_agent(&worker.codex_cmd, prompt, dir, self.config.command_timeout);
        let result = with_heartbeat(
            &self.store,
            self.config.heartbeat,
            || Self::agent_event(task, agent_id, "heartbeat", format!("{} still running", task.id)),
            run,
        )
        .await;
        let stored = result.clone();
        self.store
            .mutate(|state, _| state.last_command = Some(stored))
            .await;
        result
    }

    async fn execute_implementation(&self, task: &Task) {
        let Some(agent_id) = task.assignee.clone() else {
            return;
        };
        let id = task.id.as_str();
        let Some(worker) = self.store.read(|s| s.worker(&agent_id).cloned()).await else {
            self.block(id, "worker not found").await;
            return;
        };
        let worktree = match self.worktrees.validate(&worker, id).await {
            Ok(wt) => wt,
            Err(e) => {
                self.block(id, &format!("worktree invalid: {}", e.kind)).await;
                return;
            }
        };

        self.store
            .log(Self::agent_event(task, &agent_id, "worker_execution_started", format!("{id} by {agent_id}")))
            .await;
        let prompt = implementation_prompt(task);
        let run = self
            .run_with_heartbeat(task, &agent_id, &worker, &prompt, &worktree.worktree_path)
            .await;

        if !run.ok {
            let detail = format!(
                "{id} exit={} timeout={}",
                run.exit_code.map_or_else(|| "null".to_string(), |c| c.to_string()),
                run.timed_out
            );
            self.store
                .mutate(|state, events| {
                    apply_block(state, events, id, "worker command failed");
                    events.push(Self::agent_event(task, &agent_id, "worker_execution_failed", detail));
                })
                .await;
            return;
        }
        self.store
            .log(Self::agent_event(
                task,
                &agent_id,
                "worker_execution_succeeded",
                format!("{id} command completed"),
            ))
            .await;

        let diff = self.worktrees.diff(&worktree.worktree_path).await;
        let provenance_ok = !diff.is_empty();

        let verify = if self.config.auto_verify {
            let key = self
                .store
                .read(|s| s.agent_roles.get(&agent_id).and_then(|r| r.verify_command_key.clone()))
                .await
                .unwrap_or_else(|| DEFAULT_VERIFY_KEY.to_string());
            match self
                .runs
                .run_policy_command(&worker.repo_path, &key, &worktree.worktree_path, Some(self.config.command_timeout))
                .await
            {
                Ok((_, res)) => {
                    let ok = res.ok;
                    self.store.mutate(|state, _| state.last_command = Some(res)).await;
                    if ok {
                        VerifyOutcome::Passed(key)
                    } else {
                        VerifyOutcome::Failed(key)
                    }
                }
                Err(e) => VerifyOutcome::SetupFailed(e.to_string()),
            }
        } else {
            VerifyOutcome::Skipped
        };

        let meta = TaskRunMeta {
            task_id: id.to_string(),
            agent_id: agent_id.clone(),
            worktree_path: worktree.worktree_path.clone(),
            branch: worktree.branch.clone(),
            base_branch: "HEAD".to_string(),
            diff_length: diff.len(),
            provenance_ok,
            verify_required: self.config.auto_verify,
            verify_command_key: match &verify {
                VerifyOutcome::Passed(k) | VerifyOutcome::Failed(k) => Some(k.clone()),
                _ => None,
            },
            verified: matches!(verify, VerifyOutcome::Passed(_)),
            last_run_at: Utc::now(),
        };

        let submitted = self
            .store
            .mutate(|state, events| {
                state.task_run_meta.insert(id.to_string(), meta);
                match &verify {
                    VerifyOutcome::SetupFailed(reason) => {
                        apply_block(state, events, id, &format!("verify setup failed: {reason}"));
                        return false;
                    }
                    VerifyOutcome::Failed(key) => {
                        events.push(Self::agent_event(
                            task,
                            &agent_id,
                            "worker_verify_failed",
                            format!("{id} verify failed: {key}"),
                        ));
                        if let Err(e) = apply_rejection(state, events, id, "task_rejected", &format!("verify failed: {key}")) {
                            warn!(error = %e, "failed to reject after verify failure");
                        }
                        return false;
                    }
                    VerifyOutcome::Passed(key) => events.push(Self::agent_event(
                        task,
                        &agent_id,
                        "worker_verify_succeeded",
                        format!("{id} verify passed: {key}"),
                    )),
                    VerifyOutcome::Skipped => {}
                }
                if !provenance_ok {
                    apply_block(state, events, id, "agent produced no diff");
                    return false;
                }
                apply_submission(state, events, id, &agent_id, Some("auto-submitted")).is_ok()
            })
            .await;

        if submitted && self.config.auto_accept {
            self.chain_acceptance(id).await;
        }
    }

    /// Drive a submitted task through every acceptance stage.
    async fn chain_acceptance(&self, task_id: &str) {
        for _ in 0..3 {
            match self.acceptance.accept(task_id).await {
                Ok(outcome) if outcome.task.status == TaskStatus::Done => {
                    info!(task_id, "auto-accepted through integration");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(task_id, error = %e, "auto-accept stopped");
                    return;
                }
            }
        }
    }

    async fn execute_review(&self, task: &Task) {
        let id = task.id.as_str();
        let role = match task.status {
            TaskStatus::WaitAccept => Role::Pm,
            _ => Role::TechLead,
        };
        let (reviewer, reviewer_worker, assignee_worker) = self
            .store
            .read(|s| {
                let reviewer = s.agent_for_role(role).map(|p| p.agent_id.clone());
                let reviewer_worker = reviewer.as_deref().and_then(|a| s.worker(a).cloned());
                let assignee_worker = task.assignee.as_deref().and_then(|a| s.worker(a).cloned());
                (reviewer, reviewer_worker, assignee_worker)
            })
            .await;

        let Some(reviewer) = reviewer else {
            self.store
                .log(
                    ActivityEvent::workflow("review_agent_missing", format!("{id}: no {} agent", role.as_str()))
                        .with_workflow(task.workflow_id.clone()),
                )
                .await;
            return;
        };
        let Some(reviewer_worker) = reviewer_worker else {
            self.store
                .log(
                    ActivityEvent::workflow(
                        "review_agent_missing",
                        format!("{id}: reviewer {reviewer} has no registered worker"),
                    )
                    .with_agent(reviewer.clone())
                    .with_workflow(task.workflow_id.clone()),
                )
                .await;
            return;
        };

        let worktree = assignee_worker
            .as_ref()
            .map(|w| worktree_path(w, id))
            .filter(|p| p.exists());
        let dir = worktree.clone().unwrap_or_else(|| reviewer_worker.repo_path.clone());

        self.store
            .log(Self::agent_event(
                task,
                &reviewer,
                "worker_execution_started",
                format!("{id} {} review by {reviewer}", task.status),
            ))
            .await;
        let prompt = review_prompt(task, role, worktree.as_deref());
        let run = self
            .run_with_heartbeat(task, &reviewer, &reviewer_worker, &prompt, &dir)
            .await;

        let before = (task.status, task.updated_at);
        self.store
            .mutate(|state, events| {
                let Some(current) = state.task(id) else {
                    return;
                };
                if (current.status, current.updated_at) != before {
                    events.push(Self::agent_event(
                        task,
                        &reviewer,
                        "worker_execution_succeeded",
                        format!("{id} review decided: {}", current.status),
                    ));
                    return;
                }
                let reason = format!(
                    "{} {reviewer} made no accept/reject decision (agent command ok={})",
                    role.as_str(),
                    run.ok
                );
                events.push(Self::agent_event(task, &reviewer, "review_decision_missing", format!("{id}: {reason}")));
                if let Err(e) = apply_rejection(state, events, id, "task_rejected", &reason) {
                    warn!(error = %e, "failed to reject undecided review");
                }
            })
            .await;
    }
}
