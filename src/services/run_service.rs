//! Worker Run Service
//!
//! Drives one worker execution end to end: repository check, base branch,
//! worktree, agent command, optional follow-up command, diff collection,
//! policy verification and provenance bookkeeping. Runs can be awaited
//! directly or started in the background and polled through their
//! [`RunRecord`].

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::domain::models::{
    shell_quote, ActivityEvent, CommandResult, RunRecord, RunStatus, TaskRunMeta, TaskStatus,
};
use crate::domain::ports::{CommandRunner, RunOptions};
use crate::domain::{ErrorKind, OpError, OpResult, PolicyError};
use crate::services::lifecycle::{apply_block, apply_submission};
use crate::services::policy_service::PolicyService;
use crate::services::task_store::StateStore;
use crate::services::worktree_service::{
    branch_name, resolve_cwd_within_repo, worktree_path, BaseBranch, WorktreeService,
};

pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_millis(300_000);
pub const MAX_RUN_TIMEOUT: Duration = Duration::from_millis(3_600_000);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(10_000);
pub const MIN_HEARTBEAT: Duration = Duration::from_millis(3_000);
pub const MAX_HEARTBEAT: Duration = Duration::from_millis(120_000);
pub const DEFAULT_VERIFY_KEY: &str = "test";
pub const DEFAULT_RUN_LIST_LIMIT: usize = 50;
pub const MAX_RUN_LIST_LIMIT: usize = 200;

/// Await `fut`, logging an activity event every `every` until it finishes.
pub async fn with_heartbeat<F, T>(
    store: &StateStore,
    every: Duration,
    make_event: impl Fn() -> ActivityEvent,
    fut: F,
) -> T
where
    F: Future<Output = T>,
{
    let mut ticker = interval_at(Instant::now() + every, every);
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return out,
            _ = ticker.tick() => store.log(make_event()).await,
        }
    }
}

/// Parameters of one worker run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub agent_id: String,
    pub task_id: String,
    pub prompt: String,
    pub base_branch: Option<String>,
    pub run_after_command: Option<String>,
    pub timeout: Duration,
    pub require_verify: bool,
    pub verify_command_key: String,
    /// Move the task to doing, then to in_review or blocked
    pub auto_set_task_status: bool,
}

impl RunRequest {
    pub fn new(agent_id: impl Into<String>, task_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_id: task_id.into(),
            prompt: prompt.into(),
            base_branch: None,
            run_after_command: None,
            timeout: DEFAULT_RUN_TIMEOUT,
            require_verify: true,
            verify_command_key: DEFAULT_VERIFY_KEY.to_string(),
            auto_set_task_status: true,
        }
    }
}

/// Working tree state after a run.
#[derive(Debug, Clone, Serialize)]
pub struct GitSnapshot {
    pub status: String,
    pub diff: String,
}

/// Full payload of a completed run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRunReport {
    pub ok: bool,
    pub run_id: String,
    pub agent_id: String,
    pub task_id: String,
    pub repo: PathBuf,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub base_resolved: BaseBranch,
    pub codex: CommandResult,
    pub after: Option<CommandResult>,
    pub verify: Option<CommandResult>,
    pub verify_error: Option<String>,
    pub provenance_ok: bool,
    pub verified: bool,
    pub task_status: Option<TaskStatus>,
    pub git: GitSnapshot,
}

impl WorkerRunReport {
    pub fn summary(&self) -> String {
        if self.ok {
            format!("success diffLength={}", self.git.diff.len())
        } else {
            "failed error=RUN_INCOMPLETE".to_string()
        }
    }

    /// Short reason used when a failed run blocks its task.
    pub fn failure_reason(&self) -> String {
        if !self.codex.ok {
            format!("agent command failed: {}", self.codex.failure_reason())
        } else if !self.provenance_ok {
            "agent produced no diff".to_string()
        } else {
            format!(
                "verification failed: {}",
                self.verify_error
                    .clone()
                    .or_else(|| self.verify.as_ref().map(CommandResult::failure_reason))
                    .unwrap_or_default()
            )
        }
    }
}

/// Outcome of `verifyTask`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    #[serde(flatten)]
    pub result: CommandResult,
    pub command_key: String,
    pub resolved_command: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub task_id: Option<String>,
    pub agent_id: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: Option<usize>,
}

/// Tags every event of one run.
struct RunContext {
    agent_id: String,
    run_id: String,
    workflow_id: Option<String>,
}

impl RunContext {
    fn event(&self, action: &str, detail: impl Into<String>) -> ActivityEvent {
        ActivityEvent::agent(action, detail)
            .with_agent(self.agent_id.clone())
            .with_workflow(self.workflow_id.clone())
            .with_run(self.run_id.clone())
    }

    fn system(&self, action: &str, detail: impl Into<String>) -> ActivityEvent {
        ActivityEvent::system(action, detail)
            .with_agent(self.agent_id.clone())
            .with_workflow(self.workflow_id.clone())
            .with_run(self.run_id.clone())
    }
}

fn exit_line(res: &CommandResult) -> String {
    format!(
        "ok={} timedOut={} exitCode={}",
        res.ok,
        res.timed_out,
        res.exit_code.map_or_else(|| "null".to_string(), |c| c.to_string())
    )
}

pub struct RunService {
    store: Arc<StateStore>,
    runner: Arc<dyn CommandRunner>,
    worktrees: Arc<WorktreeService>,
    policies: Arc<PolicyService>,
    /// Extra environment handed to every worker subprocess
    env: HashMap<String, String>,
}

impl RunService {
    pub fn new(
        store: Arc<StateStore>,
        runner: Arc<dyn CommandRunner>,
        worktrees: Arc<WorktreeService>,
        policies: Arc<PolicyService>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            store,
            runner,
            worktrees,
            policies,
            env,
        }
    }

    fn options(&self, timeout: Option<Duration>) -> RunOptions {
        RunOptions {
            timeout,
            env: self.env.clone(),
        }
    }

    /// Run the agent command in `dir` with the standard prompt arguments.
    pub async fn run_agent(&self, codex_cmd: &str, prompt: &str, dir: &Path, timeout: Duration) -> CommandResult {
        let command = format!("{codex_cmd} exec {} --skip-git-repo-check", shell_quote(prompt));
        self.runner.run(&command, dir, self.options(Some(timeout))).await
    }

    /// Resolve `key` through the repository policy and run it in `dir`.
    pub async fn run_policy_command(
        &self,
        repo: &Path,
        key: &str,
        dir: &Path,
        timeout: Option<Duration>,
    ) -> Result<(String, CommandResult), PolicyError> {
        let resolved = self.policies.resolve(repo, key).await?;
        let result = self.runner.run(&resolved.command, dir, self.options(timeout)).await;
        Ok((resolved.command, result))
    }

    /// Synchronous worker run.
    #[instrument(skip(self, req), fields(agent_id = %req.agent_id, task_id = %req.task_id))]
    pub async fn run_worker_task(&self, req: &RunRequest) -> OpResult<WorkerRunReport> {
        let run_id = crate::domain::models::issue_id("run");
        self.execute(&run_id, req).await
    }

    /// The run pipeline shared by sync, async and loop-driven runs.
    pub async fn execute(&self, run_id: &str, req: &RunRequest) -> OpResult<WorkerRunReport> {
        let agent_id = req.agent_id.as_str();
        let task_id = req.task_id.as_str();

        let (worker, workflow_id) = self
            .store
            .mutate(|state, _| {
                let worker = state.require_worker(agent_id)?.clone();
                let task = state.task_mut(task_id);
                let workflow_id = task.as_ref().and_then(|t| t.workflow_id.clone());
                if let (Some(task), true) = (task, req.auto_set_task_status) {
                    task.status = TaskStatus::Doing;
                    task.touch();
                }
                Ok::<_, OpError>((worker, workflow_id))
            })
            .await?;
        let ctx = RunContext {
            agent_id: agent_id.to_string(),
            run_id: run_id.to_string(),
            workflow_id,
        };
        self.store.log(ctx.event("run_start", "runWorkerTask started")).await;

        let repo = worker.repo_path.clone();
        if !self.worktrees.is_git_repo(&repo).await {
            self.store
                .log(ctx.event("run_fail", format!("not git repo: {}", repo.display())))
                .await;
            return Err(OpError::new(
                ErrorKind::NotGitRepo,
                format!("not a git repository: {}", repo.display()),
            )
            .with_detail(json!({ "agentId": agent_id, "taskId": task_id, "runId": run_id, "repo": repo })));
        }

        let base = self
            .worktrees
            .resolve_base_branch(&repo, req.base_branch.as_deref())
            .await;
        self.store
            .log(ctx.event(
                "base_resolved",
                format!("base={}, tried={}", base.branch, base.tried.join(",")),
            ))
            .await;

        let branch = branch_name(agent_id, task_id);
        let wt_path = worktree_path(&worker, task_id);
        match self.worktrees.validate(&worker, task_id).await {
            Ok(_) => debug!(path = %wt_path.display(), "reusing task worktree"),
            Err(e) if e.kind == ErrorKind::WorktreeNotFound => {
                self.store
                    .log(ctx.event(
                        "worktree_add_start",
                        format!("branch={branch} path={} base={}", wt_path.display(), base.branch),
                    ))
                    .await;
                if let Err(e) = self.worktrees.create(&worker, task_id, &base.branch).await {
                    return Err(self.fail_setup(&ctx, req, e, &base).await);
                }
            }
            Err(e) => return Err(self.fail_setup(&ctx, req, e, &base).await),
        }

        self.store
            .log(ctx.event("codex_start", format!("timeoutMs={}", req.timeout.as_millis())))
            .await;
        let codex = self
            .run_agent(&worker.codex_cmd, &req.prompt, &wt_path, req.timeout)
            .await;
        self.store.log(ctx.event("codex_exit", exit_line(&codex))).await;

        let after = match req.run_after_command.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(command) => {
                self.store.log(ctx.event("after_start", command)).await;
                let res = self
                    .runner
                    .run(command, &wt_path, self.options(Some(req.timeout)))
                    .await;
                self.store.log(ctx.event("after_exit", exit_line(&res))).await;
                Some(res)
            }
            None => None,
        };

        let diff = self.worktrees.diff(&wt_path).await;
        let status = self
            .runner
            .run("git status --porcelain=v1", &wt_path, RunOptions::default())
            .await;
        self.store
            .log(ctx.event("diff_collected", format!("diffLength={}", diff.len())))
            .await;
        let provenance_ok = !diff.is_empty();

        let (verify, verify_error) = if req.require_verify {
            match self.policies.resolve(&repo, &req.verify_command_key).await {
                Ok(resolved) => {
                    self.store
                        .log(ctx.event(
                            "verify_start",
                            format!("{} -> {}", req.verify_command_key, resolved.command),
                        ))
                        .await;
                    let res = self
                        .runner
                        .run(&resolved.command, &wt_path, self.options(Some(req.timeout)))
                        .await;
                    self.store.log(ctx.event("verify_exit", exit_line(&res))).await;
                    (Some(res), None)
                }
                Err(e) => {
                    let message = e.to_string();
                    self.store.log(ctx.event("verify_error", message.clone())).await;
                    (None, Some(message))
                }
            }
        } else {
            (None, None)
        };
        let verified = verify.as_ref().is_some_and(|v| v.ok);
        let ok = codex.ok && provenance_ok && (!req.require_verify || verified);

        let mut report = WorkerRunReport {
            ok,
            run_id: run_id.to_string(),
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            repo,
            worktree_path: wt_path,
            branch,
            base_resolved: base,
            codex,
            after,
            verify,
            verify_error,
            provenance_ok,
            verified,
            task_status: None,
            git: GitSnapshot {
                status: if status.ok { status.stdout } else { String::new() },
                diff,
            },
        };

        let meta = TaskRunMeta {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            worktree_path: report.worktree_path.clone(),
            branch: report.branch.clone(),
            base_branch: report.base_resolved.branch.clone(),
            diff_length: report.git.diff.len(),
            provenance_ok,
            verify_required: req.require_verify,
            verify_command_key: Some(req.verify_command_key.clone()),
            verified,
            last_run_at: Utc::now(),
        };
        let block_reason = (!ok).then(|| report.failure_reason());
        report.task_status = self
            .store
            .mutate(|state, events| {
                state.task_run_meta.insert(task_id.to_string(), meta);
                if req.auto_set_task_status && state.task(task_id).is_some() {
                    match &block_reason {
                        Some(reason) => {
                            apply_block(state, events, task_id, reason);
                        }
                        None => {
                            if let Err(e) = apply_submission(state, events, task_id, agent_id, None) {
                                warn!(error = %e, "failed to submit task after run");
                            }
                        }
                    }
                }
                events.push(if ok {
                    ctx.event("run_done", "runWorkerTask completed")
                } else {
                    ctx.event(
                        "run_incomplete",
                        format!("ok={} provenance={provenance_ok} verified={verified}", report.codex.ok),
                    )
                });
                state.task(task_id).map(|t| t.status)
            })
            .await;

        info!(ok, provenance_ok, verified, "worker run finished");
        Ok(report)
    }

    async fn fail_setup(&self, ctx: &RunContext, req: &RunRequest, err: OpError, base: &BaseBranch) -> OpError {
        error!(task_id = %req.task_id, error = %err, "worktree setup failed for run");
        let reason = format!("worktree setup failed: {}", err.kind);
        let stderr = match &err.detail["command"]["stderr"] {
            Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => err.message.clone(),
        };
        self.store
            .mutate(|state, events| {
                events.push(ctx.event("worktree_add_fail", stderr));
                if req.auto_set_task_status {
                    apply_block(state, events, &req.task_id, &reason);
                }
            })
            .await;
        let kind = if err.kind == ErrorKind::WorktreeAddFailed || err.kind == ErrorKind::WorktreeNotFound {
            ErrorKind::WorktreeAddFailed
        } else {
            err.kind
        };
        OpError::new(kind, err.message.clone()).with_detail(json!({
            "agentId": req.agent_id,
            "taskId": req.task_id,
            "runId": ctx.run_id,
            "baseResolved": base,
            "detail": err.detail,
        }))
    }

    /// Queue a run and drive it in the background.
    #[instrument(skip(self, req), fields(agent_id = %req.agent_id, task_id = %req.task_id))]
    pub async fn start(self: &Arc<Self>, req: RunRequest, heartbeat: Duration) -> RunRecord {
        let heartbeat = heartbeat.clamp(MIN_HEARTBEAT, MAX_HEARTBEAT);
        let run = RunRecord::queued(&req.task_id, &req.agent_id);
        let record = run.clone();
        self.store
            .mutate(|state, events| {
                let workflow_id = state.task(&req.task_id).and_then(|t| t.workflow_id.clone());
                events.push(
                    ActivityEvent::system("async_run_queued", format!("queued run {}", run.run_id))
                        .with_agent(run.agent_id.clone())
                        .with_workflow(workflow_id)
                        .with_run(run.run_id.clone()),
                );
                state.runs.insert(run.run_id.clone(), run);
            })
            .await;

        let service = Arc::clone(self);
        let run_id = record.run_id.clone();
        tokio::spawn(async move { service.drive(run_id, req, heartbeat).await });
        record
    }

    async fn drive(self: Arc<Self>, run_id: String, req: RunRequest, heartbeat: Duration) {
        let workflow_id = self
            .store
            .read(|s| s.task(&req.task_id).and_then(|t| t.workflow_id.clone()))
            .await;
        let ctx = RunContext {
            agent_id: req.agent_id.clone(),
            run_id: run_id.clone(),
            workflow_id,
        };

        let started = self
            .store
            .mutate(|state, events| {
                let Some(run) = state.runs.get_mut(&run_id) else {
                    return false;
                };
                let now = Utc::now();
                run.updated_at = now;
                if run.cancel_requested {
                    run.status = RunStatus::Canceled;
                    run.finished_at = Some(now);
                    run.summary = Some("canceled before start".to_string());
                    events.push(ctx.system("async_run_canceled", format!("run {run_id} canceled")));
                    return false;
                }
                run.status = RunStatus::Running;
                run.started_at = Some(now);
                events.push(ctx.system("async_run_started", format!("run {run_id} started")));
                true
            })
            .await;
        if !started {
            return;
        }

        let service = Arc::clone(&self);
        let inner_id = run_id.clone();
        let inner_req = req.clone();
        let handle = tokio::spawn(async move { service.execute(&inner_id, &inner_req).await });
        let joined = with_heartbeat(
            &self.store,
            heartbeat,
            || ctx.system("heartbeat", "run still running"),
            handle,
        )
        .await;

        self.store
            .mutate(|state, events| {
                let Some(run) = state.runs.get_mut(&run_id) else {
                    return;
                };
                let now = Utc::now();
                run.updated_at = now;
                run.finished_at = Some(now);
                match joined {
                    Ok(Ok(report)) => {
                        run.status = if report.ok { RunStatus::Succeeded } else { RunStatus::Failed };
                        run.summary = Some(report.summary());
                        run.base_branch = Some(report.base_resolved.branch.clone());
                        run.branch = Some(report.branch.clone());
                        run.worktree_path = Some(report.worktree_path.clone());
                        run.result = serde_json::to_value(&report).ok();
                        events.push(ctx.system(
                            "async_run_finished",
                            format!("run {run_id} -> {}", run.status.as_str()),
                        ));
                    }
                    Ok(Err(err)) => {
                        run.status = RunStatus::Failed;
                        run.summary = Some(format!("failed error={}", err.kind));
                        run.result = Some(err.to_json());
                        events.push(ctx.system("async_run_finished", format!("run {run_id} -> failed")));
                    }
                    Err(join_err) => {
                        run.status = RunStatus::Failed;
                        run.summary = Some("failed exception".to_string());
                        run.error = Some(join_err.to_string());
                        events.push(ctx.system("async_run_error", join_err.to_string()));
                    }
                }
            })
            .await;
    }

    pub async fn get_run(&self, run_id: &str) -> OpResult<RunRecord> {
        self.store
            .read(|s| s.runs.get(run_id).cloned())
            .await
            .ok_or_else(|| {
                OpError::new(ErrorKind::RunNotFound, format!("Run not found: {run_id}"))
                    .with_detail(json!({ "runId": run_id }))
            })
    }

    /// Runs matching `filter`, newest first.
    pub async fn list_runs(&self, filter: &RunFilter) -> Vec<RunRecord> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_RUN_LIST_LIMIT)
            .clamp(1, MAX_RUN_LIST_LIMIT);
        self.store
            .read(|s| {
                let mut runs: Vec<RunRecord> = s
                    .runs
                    .values()
                    .filter(|r| filter.task_id.as_ref().is_none_or(|t| &r.task_id == t))
                    .filter(|r| filter.agent_id.as_ref().is_none_or(|a| &r.agent_id == a))
                    .filter(|r| filter.status.is_none_or(|st| r.status == st))
                    .cloned()
                    .collect();
                runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                runs.truncate(limit);
                runs
            })
            .await
    }

    /// Ask a run to stop. Only queued runs observe the flag.
    pub async fn cancel(&self, run_id: &str) -> OpResult<RunRecord> {
        self.store
            .mutate(|state, events| {
                let run = state.runs.get_mut(run_id).ok_or_else(|| {
                    OpError::new(ErrorKind::RunNotFound, format!("Run not found: {run_id}"))
                        .with_detail(json!({ "runId": run_id }))
                })?;
                if !run.status.is_terminal() {
                    run.cancel_requested = true;
                    run.updated_at = Utc::now();
                    events.push(
                        ActivityEvent::system("async_run_cancel_requested", format!("run {run_id}"))
                            .with_agent(run.agent_id.clone())
                            .with_run(run_id),
                    );
                }
                Ok(run.clone())
            })
            .await
    }

    /// Run a policy command inside the task worktree and record the result.
    #[instrument(skip(self))]
    pub async fn verify_task(&self, agent_id: &str, task_id: &str, command_key: &str) -> OpResult<VerifyOutcome> {
        let worker = self
            .store
            .read(|s| s.require_worker(agent_id).cloned())
            .await?;
        let cwd = worktree_path(&worker, task_id);
        let (resolved_command, result) = self
            .run_policy_command(&worker.repo_path, command_key, &cwd, None)
            .await?;

        let ok = result.ok;
        let stored = result.clone();
        self.store
            .mutate(|state, events| {
                state.last_command = Some(stored);
                if let Some(meta) = state.task_run_meta.get_mut(task_id) {
                    meta.verified = ok;
                    meta.verify_command_key = Some(command_key.to_string());
                }
                events.push(
                    ActivityEvent::agent(
                        if ok { "verify_task_passed" } else { "verify_task_failed" },
                        format!("{task_id} {command_key}"),
                    )
                    .with_agent(agent_id),
                );
            })
            .await;
        Ok(VerifyOutcome {
            result,
            command_key: command_key.to_string(),
            resolved_command,
        })
    }

    /// Run a policy-approved command inside a worker repository.
    #[instrument(skip(self))]
    pub async fn run_command(&self, agent_id: &str, command_key: &str, cwd: Option<&str>) -> OpResult<CommandResult> {
        let worker = self
            .store
            .read(|s| s.require_worker(agent_id).cloned())
            .await?;
        let dir = resolve_cwd_within_repo(&worker.repo_path, cwd)?;
        let (_, result) = self
            .run_policy_command(&worker.repo_path, command_key, &dir, None)
            .await?;
        let stored = result.clone();
        self.store
            .mutate(|state, _| state.last_command = Some(stored))
            .await;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Task;
    use crate::services::test_support::{init_repo, shell, store_with, worker};

    const POLICY: &str = "commands:\n  test: test -f README.md\n  fail: exit 1\nsecurity:\n  allow: [test, fail]\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        repo: PathBuf,
        service: Arc<RunService>,
    }

    async fn fixture() -> Fixture {
        let (dir, repo) = init_repo();
        std::fs::create_dir_all(repo.join(".agent")).unwrap();
        std::fs::write(repo.join(".agent/policy.yaml"), POLICY).unwrap();
        let store = store_with(&[worker("W1", &repo)]).await;
        let service = Arc::new(RunService::new(
            store,
            shell(),
            Arc::new(WorktreeService::new(shell())),
            Arc::new(PolicyService::new()),
            HashMap::new(),
        ));
        Fixture {
            _dir: dir,
            repo,
            service,
        }
    }

    async fn add_task(f: &Fixture, id: &str) {
        f.service
            .store
            .mutate(|s, _| s.tasks.push(Task::with_id(id, "run me", None)))
            .await;
    }

    #[tokio::test]
    async fn test_successful_run_submits_task_with_provenance() {
        let f = fixture().await;
        add_task(&f, "T").await;

        let report = f
            .service
            .run_worker_task(&RunRequest::new("W1", "T", "do it"))
            .await
            .unwrap();
        assert!(report.ok, "{report:?}");
        assert!(report.provenance_ok);
        assert!(report.verified);
        assert!(report.git.diff.contains("change-by-W1"));
        assert_eq!(report.task_status, Some(TaskStatus::InReview));
        assert_eq!(report.base_resolved.branch, "main");

        let (meta, actions) = f
            .service
            .store
            .read(|s| {
                (
                    s.task_run_meta.get("T").cloned(),
                    s.activity_log.iter().map(|e| e.action.clone()).collect::<Vec<_>>(),
                )
            })
            .await;
        let meta = meta.unwrap();
        assert!(meta.provenance_ok && meta.verified);
        for action in ["run_start", "base_resolved", "worktree_add_start", "codex_exit", "verify_exit", "run_done"] {
            assert!(actions.iter().any(|a| a == action), "missing {action}");
        }
    }

    #[tokio::test]
    async fn test_failed_verify_blocks_task() {
        let f = fixture().await;
        add_task(&f, "T").await;
        let mut req = RunRequest::new("W1", "T", "do it");
        req.verify_command_key = "fail".into();

        let report = f.service.run_worker_task(&req).await.unwrap();
        assert!(!report.ok);
        assert!(report.provenance_ok);
        assert_eq!(report.task_status, Some(TaskStatus::Blocked));
        let reason = f
            .service
            .store
            .read(|s| s.task("T").and_then(|t| t.block_reason.clone()))
            .await;
        assert!(reason.unwrap().starts_with("verification failed"));
    }

    #[tokio::test]
    async fn test_rejected_verify_key_is_reported_not_raised() {
        let f = fixture().await;
        add_task(&f, "T").await;
        let mut req = RunRequest::new("W1", "T", "do it");
        req.verify_command_key = "rm -rf /".into();

        let report = f.service.run_worker_task(&req).await.unwrap();
        assert!(!report.ok);
        assert!(report.verify.is_none());
        assert!(report.verify_error.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_not_git_repo() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_with(&[worker("W1", dir.path())]).await;
        let service = RunService::new(
            store,
            shell(),
            Arc::new(WorktreeService::new(shell())),
            Arc::new(PolicyService::new()),
            HashMap::new(),
        );
        let err = service
            .run_worker_task(&RunRequest::new("W1", "T", "x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotGitRepo);
    }

    #[tokio::test]
    async fn test_async_run_reaches_terminal_state() {
        let f = fixture().await;
        add_task(&f, "T").await;
        let record = f
            .service
            .start(RunRequest::new("W1", "T", "do it"), DEFAULT_HEARTBEAT)
            .await;
        assert_eq!(record.status, RunStatus::Queued);

        let mut status = RunStatus::Queued;
        for _ in 0..200 {
            status = f.service.get_run(&record.run_id).await.unwrap().status;
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(status, RunStatus::Succeeded);
        let run = f.service.get_run(&record.run_id).await.unwrap();
        assert!(run.summary.unwrap().starts_with("success"));
        assert_eq!(f.service.list_runs(&RunFilter::default()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let f = fixture().await;
        let run = RunRecord::queued("T", "W1");
        let run_id = run.run_id.clone();
        f.service.store.mutate(|s, _| s.runs.insert(run_id.clone(), run)).await;

        let canceled = f.service.cancel(&run_id).await.unwrap();
        assert!(canceled.cancel_requested);
        Arc::clone(&f.service)
            .drive(run_id.clone(), RunRequest::new("W1", "T", "x"), DEFAULT_HEARTBEAT)
            .await;
        assert_eq!(f.service.get_run(&run_id).await.unwrap().status, RunStatus::Canceled);
        assert_eq!(
            f.service.cancel("nope").await.unwrap_err().kind,
            ErrorKind::RunNotFound
        );
    }

    #[tokio::test]
    async fn test_run_command_is_policy_and_cwd_gated() {
        let f = fixture().await;
        let ok = f.service.run_command("W1", "test", None).await.unwrap();
        assert!(ok.ok);
        assert_eq!(ok.cwd, f.repo);

        let err = f.service.run_command("W1", "ls", None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CommandRejected);
        let err = f.service.run_command("W1", "test", Some("../..")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::CwdRejected);
        let last = f.service.store.read(|s| s.last_command.clone()).await;
        assert!(last.is_some());
    }

    #[tokio::test]
    async fn test_list_runs_filters_and_orders() {
        let f = fixture().await;
        f.service
            .store
            .mutate(|s, _| {
                for (task, status) in [("A", RunStatus::Failed), ("B", RunStatus::Succeeded), ("A", RunStatus::Succeeded)] {
                    let mut run = RunRecord::queued(task, "W1");
                    run.status = status;
                    s.runs.insert(run.run_id.clone(), run);
                }
            })
            .await;
        let only_a = f
            .service
            .list_runs(&RunFilter {
                task_id: Some("A".into()),
                ..RunFilter::default()
            })
            .await;
        assert_eq!(only_a.len(), 2);
        assert!(only_a[0].created_at >= only_a[1].created_at);
        let succeeded = f
            .service
            .list_runs(&RunFilter {
                status: Some(RunStatus::Succeeded),
                limit: Some(1),
                ..RunFilter::default()
            })
            .await;
        assert_eq!(succeeded.len(), 1);
    }
}
