//! Worktree Service
//!
//! Git worktree management for task isolation. Every (agent, task) pair gets
//! a deterministic branch and worktree directory under the worker's
//! worktree root, so parallel tasks never share a checkout.
//!
//! # Naming Convention
//!
//! - Branch: `agent/<agent_id>/<sanitized_task_id>`
//! - Worktree path: `<worktree_root>/<agent_id>__<sanitized_task_id>`
//!
//! Sanitizing collapses every run of characters outside `[A-Za-z0-9._-]`
//! into a single `-` and truncates to 80 characters. Two task ids that only
//! differ past the cut collide; that is a known limitation.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};

use crate::domain::models::{shell_quote, CommandResult, Worker};
use crate::domain::ports::{CommandRunner, RunOptions};
use crate::domain::{ErrorKind, OpError, OpResult};

const MAX_SANITIZED_LEN: usize = 80;
const PATCH_FILE: &str = ".mcp_patch.diff";
const ARCHIVE_DIR: &str = "_archives";

/// Make a task id safe for branch and directory names.
pub fn sanitize(task_id: &str) -> String {
    let mut out = String::with_capacity(task_id.len());
    let mut in_run = false;
    for c in task_id.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    out.chars().take(MAX_SANITIZED_LEN).collect()
}

pub fn branch_name(agent_id: &str, task_id: &str) -> String {
    format!("agent/{agent_id}/{}", sanitize(task_id))
}

pub fn worktree_path(worker: &Worker, task_id: &str) -> PathBuf {
    worker
        .worktree_root
        .join(format!("{}__{}", worker.agent_id, sanitize(task_id)))
}

/// Normalize `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `cwd` (absolute, or relative to the repo) and require it to stay
/// inside the repository.
pub fn resolve_cwd_within_repo(repo_path: &Path, cwd: Option<&str>) -> OpResult<PathBuf> {
    let resolved = match cwd.map(str::trim).filter(|c| !c.is_empty()) {
        None => repo_path.to_path_buf(),
        Some(c) if Path::new(c).is_absolute() => normalize(Path::new(c)),
        Some(c) => normalize(&repo_path.join(c)),
    };
    let repo = normalize(repo_path);
    if resolved.starts_with(&repo) {
        Ok(resolved)
    } else {
        Err(OpError::new(
            ErrorKind::CwdRejected,
            format!(
                "cwd must be inside repo. repo={}, cwd={}",
                repo.display(),
                resolved.display()
            ),
        ))
    }
}

/// Location and branch of a task worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskWorktree {
    pub worktree_path: PathBuf,
    pub branch: String,
}

/// Result of base branch resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseBranch {
    pub branch: String,
    /// Candidates tried, in order
    pub tried: Vec<String>,
}

/// Tagged outcome of cherry-picking a task commit onto the target branch.
#[derive(Debug, Clone, PartialEq)]
pub enum Integration {
    Applied { target_branch: String, commit: String },
    AlreadyApplied { target_branch: String, commit: String },
    Conflict { reason: String, detail: Value },
}

impl Integration {
    fn conflict(reason: impl Into<String>, result: Option<&CommandResult>) -> Self {
        Self::Conflict {
            reason: reason.into(),
            detail: result
                .and_then(|r| serde_json::to_value(r).ok())
                .unwrap_or(Value::Null),
        }
    }

    /// Wire shape reported by `acceptTask`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Applied { target_branch, commit } => json!({
                "enabled": true, "status": "applied", "targetBranch": target_branch, "commit": commit
            }),
            Self::AlreadyApplied { target_branch, commit } => json!({
                "enabled": true, "status": "already_applied", "targetBranch": target_branch, "commit": commit
            }),
            Self::Conflict { reason, .. } => json!({
                "enabled": true, "status": "conflict", "reason": reason
            }),
        }
    }
}

/// Files written before a forced cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupArchive {
    pub diff_path: PathBuf,
    pub staged_path: PathBuf,
    pub status_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub ok: bool,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub archive: Option<CleanupArchive>,
    pub remove: CommandResult,
    pub branch_delete: Option<CommandResult>,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOutcome {
    pub ok: bool,
    pub target_dir: PathBuf,
    pub apply: CommandResult,
    pub status: CommandResult,
}

/// Service for managing git worktrees for tasks.
pub struct WorktreeService {
    runner: Arc<dyn CommandRunner>,
}

impl WorktreeService {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn git(&self, args: &str, cwd: &Path) -> CommandResult {
        self.runner
            .run(&format!("git {args}"), cwd, RunOptions::default())
            .await
    }

    pub async fn is_git_repo(&self, path: &Path) -> bool {
        let res = self.git("rev-parse --is-inside-work-tree", path).await;
        res.ok && res.stdout_trimmed() == "true"
    }

    pub async fn current_branch(&self, path: &Path) -> Option<String> {
        let res = self.git("rev-parse --abbrev-ref HEAD", path).await;
        res.ok.then(|| res.stdout_trimmed().to_string())
    }

    /// Pick the base branch for a new worktree.
    ///
    /// Candidates in order: `preferred`, the branch `origin/HEAD` points at,
    /// `main`, `master`, then the current branch. Each is accepted as a local
    /// branch or as `origin/<candidate>`. Falls back to `HEAD`.
    #[instrument(skip(self), fields(repo = %repo.display()))]
    pub async fn resolve_base_branch(&self, repo: &Path, preferred: Option<&str>) -> BaseBranch {
        let mut candidates: Vec<String> = Vec::new();
        let mut push = |c: &str| {
            let c = c.trim();
            if !c.is_empty() && c != "HEAD" && !candidates.iter().any(|x| x == c) {
                candidates.push(c.to_string());
            }
        };

        if let Some(p) = preferred {
            push(p);
        }
        let origin_head = self
            .git("symbolic-ref --quiet --short refs/remotes/origin/HEAD", repo)
            .await;
        if origin_head.ok {
            let head = origin_head.stdout_trimmed();
            push(head.strip_prefix("origin/").unwrap_or(head));
        }
        push("main");
        push("master");
        if let Some(current) = self.current_branch(repo).await {
            push(&current);
        }

        for candidate in &candidates {
            let local = self
                .git(
                    &format!("show-ref --verify --quiet {}", shell_quote(&format!("refs/heads/{candidate}"))),
                    repo,
                )
                .await;
            if local.ok {
                debug!(branch = %candidate, "resolved base branch");
                return BaseBranch {
                    branch: candidate.clone(),
                    tried: candidates.clone(),
                };
            }
            let remote = self
                .git(
                    &format!(
                        "show-ref --verify --quiet {}",
                        shell_quote(&format!("refs/remotes/origin/{candidate}"))
                    ),
                    repo,
                )
                .await;
            if remote.ok {
                debug!(branch = %candidate, "resolved base branch on origin");
                return BaseBranch {
                    branch: format!("origin/{candidate}"),
                    tried: candidates.clone(),
                };
            }
        }

        warn!(tried = ?candidates, "no base branch candidate resolved, using HEAD");
        BaseBranch {
            branch: "HEAD".to_string(),
            tried: candidates,
        }
    }

    /// Paths of every worktree registered with the repository.
    pub async fn list_worktrees(&self, repo: &Path) -> OpResult<Vec<PathBuf>> {
        let res = self.git("worktree list --porcelain", repo).await;
        if !res.ok {
            return Err(OpError::new(
                ErrorKind::WorktreeListFailed,
                format!("git worktree list failed: {}", res.failure_reason()),
            )
            .with_command(&res));
        }
        Ok(res
            .stdout
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }

    /// Confirm the task worktree is registered and on its expected branch.
    #[instrument(skip(self, worker), fields(agent_id = %worker.agent_id))]
    pub async fn validate(&self, worker: &Worker, task_id: &str) -> OpResult<TaskWorktree> {
        let path = worktree_path(worker, task_id);
        let branch = branch_name(&worker.agent_id, task_id);

        let registered = self.list_worktrees(&worker.repo_path).await?;
        let target = canonical(&path).await;
        let mut found = false;
        for candidate in &registered {
            if canonical(candidate).await == target {
                found = true;
                break;
            }
        }
        if !found {
            return Err(OpError::new(
                ErrorKind::WorktreeNotFound,
                format!("worktree not registered: {}", path.display()),
            )
            .with_detail(json!({ "worktreePath": path, "branch": branch })));
        }

        let head = self.git("rev-parse --abbrev-ref HEAD", &path).await;
        if !head.ok {
            return Err(OpError::new(
                ErrorKind::WorktreeBranchCheckFailed,
                format!("failed to read worktree branch: {}", head.failure_reason()),
            )
            .with_command(&head));
        }
        let actual = head.stdout_trimmed();
        if actual != branch {
            warn!(expected = %branch, actual, "worktree is on an unexpected branch");
            return Err(OpError::new(
                ErrorKind::WorktreeBranchMismatch,
                format!("worktree is on {actual}, expected {branch}"),
            )
            .with_detail(json!({ "worktreePath": path, "expected": branch, "actual": actual })));
        }

        Ok(TaskWorktree {
            worktree_path: path,
            branch,
        })
    }

    /// Validate, creating the worktree from `HEAD` when it is not registered.
    ///
    /// Other validation failures are passed through untouched. Returns
    /// whether a worktree was created.
    pub async fn ensure(&self, worker: &Worker, task_id: &str) -> OpResult<(TaskWorktree, bool)> {
        match self.validate(worker, task_id).await {
            Ok(worktree) => Ok((worktree, false)),
            Err(e) if e.kind == ErrorKind::WorktreeNotFound => {
                let created = self.create(worker, task_id, "HEAD").await?;
                Ok((created, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Create the task worktree and branch from `base`.
    ///
    /// When the branch already exists (left over from an earlier run) the
    /// worktree is attached to it instead.
    #[instrument(skip(self, worker), fields(agent_id = %worker.agent_id))]
    pub async fn create(&self, worker: &Worker, task_id: &str, base: &str) -> OpResult<TaskWorktree> {
        let path = worktree_path(worker, task_id);
        let branch = branch_name(&worker.agent_id, task_id);

        if let Err(e) = tokio::fs::create_dir_all(&worker.worktree_root).await {
            error!(root = %worker.worktree_root.display(), error = %e, "failed to create worktree root");
            return Err(OpError::new(
                ErrorKind::WorktreeAddFailed,
                format!("failed to create worktree root: {e}"),
            ));
        }

        let path_arg = shell_quote(&path.to_string_lossy());
        let add = self
            .git(
                &format!("worktree add -b {} {path_arg} {}", shell_quote(&branch), shell_quote(base)),
                &worker.repo_path,
            )
            .await;
        if add.ok {
            info!(branch = %branch, path = %path.display(), base, "created task worktree");
            return Ok(TaskWorktree {
                worktree_path: path,
                branch,
            });
        }

        if add.stderr.contains("already exists") && !path.exists() {
            warn!(branch = %branch, "branch exists, attaching worktree to it");
            let attach = self
                .git(
                    &format!("worktree add {path_arg} {}", shell_quote(&branch)),
                    &worker.repo_path,
                )
                .await;
            if attach.ok {
                return Ok(TaskWorktree {
                    worktree_path: path,
                    branch,
                });
            }
            error!(error = %attach.failure_reason(), "failed to attach worktree to existing branch");
            return Err(add_failed(&attach));
        }

        error!(error = %add.failure_reason(), "failed to create task worktree");
        Err(add_failed(&add))
    }

    /// Unstaged plus staged diff of a worktree.
    pub async fn diff(&self, path: &Path) -> String {
        let unstaged = self.git("diff", path).await;
        let staged = self.git("diff --staged", path).await;
        let mut diff = String::new();
        if unstaged.ok {
            diff.push_str(&unstaged.stdout);
        }
        if staged.ok {
            diff.push_str(&staged.stdout);
        }
        diff
    }

    /// Commit any pending worktree changes and cherry-pick the result onto
    /// `target_branch`, which must be checked out and clean in the repo.
    #[instrument(skip(self, worker), fields(agent_id = %worker.agent_id))]
    pub async fn integrate(&self, worker: &Worker, task_id: &str, target_branch: &str) -> Integration {
        let worktree = match self.validate(worker, task_id).await {
            Ok(wt) => wt,
            Err(e) => {
                return Integration::Conflict {
                    reason: format!("task worktree invalid: {}", e.kind),
                    detail: e.to_json(),
                }
            }
        };
        let wt = &worktree.worktree_path;

        let status = self.git("status --porcelain", wt).await;
        if !status.ok {
            return Integration::conflict("failed to read task worktree status", Some(&status));
        }
        if !status.stdout_trimmed().is_empty() {
            let add = self.git("add -A", wt).await;
            if !add.ok {
                return Integration::conflict("failed to stage task worktree changes", Some(&add));
            }
            let message = format!("cowai: apply {task_id}");
            let commit = self.git(&format!("commit -m {}", shell_quote(&message)), wt).await;
            if !commit.ok {
                return Integration::conflict("failed to commit task worktree changes", Some(&commit));
            }
        }

        let head = self.git("rev-parse HEAD", wt).await;
        if !head.ok {
            return Integration::conflict("failed to resolve task commit", Some(&head));
        }
        let commit = head.stdout_trimmed().to_string();

        let repo = &worker.repo_path;
        let Some(current) = self.current_branch(repo).await else {
            return Integration::conflict("failed to resolve target branch", None);
        };
        if current != target_branch {
            return Integration::conflict(
                format!("target repo is on {current}, expected {target_branch}"),
                None,
            );
        }

        let target_status = self.git("status --porcelain --untracked-files=no", repo).await;
        if !target_status.ok {
            return Integration::conflict("failed to check target branch status", Some(&target_status));
        }
        if !target_status.stdout_trimmed().is_empty() {
            return Integration::conflict("target branch has local tracked changes", Some(&target_status));
        }

        let ancestor = self
            .git(&format!("merge-base --is-ancestor {} HEAD", shell_quote(&commit)), repo)
            .await;
        if ancestor.ok {
            info!(commit = %commit, target_branch, "task commit already on target");
            return Integration::AlreadyApplied {
                target_branch: target_branch.to_string(),
                commit,
            };
        }

        // A cherry-picked copy is not an ancestor; look for an equivalent patch.
        let cherry = self
            .git(
                &format!("cherry HEAD {} {}", shell_quote(&commit), shell_quote(&format!("{commit}^"))),
                repo,
            )
            .await;
        if cherry.ok && cherry.stdout_trimmed().starts_with('-') {
            info!(commit = %commit, target_branch, "equivalent change already on target");
            return Integration::AlreadyApplied {
                target_branch: target_branch.to_string(),
                commit,
            };
        }

        let pick = self
            .git(&format!("cherry-pick --ff --no-edit {}", shell_quote(&commit)), repo)
            .await;
        if !pick.ok {
            error!(commit = %commit, error = %pick.failure_reason(), "cherry-pick failed");
            return Integration::conflict("git cherry-pick failed", Some(&pick));
        }

        info!(commit = %commit, target_branch, "task commit integrated");
        Integration::Applied {
            target_branch: target_branch.to_string(),
            commit,
        }
    }

    /// Apply a unified diff inside `dir`, then report `git status`.
    pub async fn apply_patch(&self, dir: &Path, patch: &str) -> OpResult<PatchOutcome> {
        let patch_file = dir.join(PATCH_FILE);
        tokio::fs::write(&patch_file, patch).await.map_err(|e| {
            OpError::invalid_argument(format!("failed to write patch file: {e}"))
                .with_detail(json!({ "targetDir": dir }))
        })?;

        let apply = self
            .git(
                &format!("apply --whitespace=nowarn {}", shell_quote(&patch_file.to_string_lossy())),
                dir,
            )
            .await;
        if let Err(e) = tokio::fs::remove_file(&patch_file).await {
            debug!(error = %e, "failed to remove patch file");
        }
        let status = self.git("status --porcelain=v1", dir).await;

        Ok(PatchOutcome {
            ok: apply.ok,
            target_dir: dir.to_path_buf(),
            apply,
            status,
        })
    }

    /// Remove a task worktree, optionally archiving its state and deleting
    /// its branch.
    ///
    /// The directory is only deleted outright when git removed the worktree
    /// or the caller forced it.
    #[instrument(skip(self, worker), fields(agent_id = %worker.agent_id))]
    pub async fn cleanup(
        &self,
        worker: &Worker,
        task_id: &str,
        force: bool,
        delete_branch: bool,
        archive_before_force: bool,
    ) -> CleanupReport {
        let path = worktree_path(worker, task_id);
        let branch = branch_name(&worker.agent_id, task_id);

        let archive = if force && archive_before_force {
            self.archive(worker, task_id, &path).await
        } else {
            None
        };

        let remove = self
            .git(
                &format!(
                    "worktree remove {}{}",
                    if force { "--force " } else { "" },
                    shell_quote(&path.to_string_lossy())
                ),
                &worker.repo_path,
            )
            .await;

        if remove.ok || force {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove worktree directory"),
            }
        }

        let branch_delete = if delete_branch {
            Some(
                self.git(
                    &format!("branch {} {}", if force { "-D" } else { "-d" }, shell_quote(&branch)),
                    &worker.repo_path,
                )
                .await,
            )
        } else {
            None
        };

        let warning = (force && !archive_before_force)
            .then(|| "force cleanup may discard uncommitted state".to_string());

        CleanupReport {
            ok: remove.ok,
            worktree_path: path,
            branch,
            archive,
            remove,
            branch_delete,
            warning,
        }
    }

    async fn archive(&self, worker: &Worker, task_id: &str, path: &Path) -> Option<CleanupArchive> {
        let dir = worker.worktree_root.join(ARCHIVE_DIR);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(dir = %dir.display(), error = %e, "failed to create archive directory");
            return None;
        }
        let stem = format!(
            "{}__{}__{}",
            worker.agent_id,
            sanitize(task_id),
            Utc::now().timestamp_millis()
        );
        let archive = CleanupArchive {
            diff_path: dir.join(format!("{stem}.diff")),
            staged_path: dir.join(format!("{stem}__staged.diff")),
            status_path: dir.join(format!("{stem}__status.txt")),
        };

        let unstaged = self.git("diff", path).await;
        let staged = self.git("diff --staged", path).await;
        let status = self.git("status --porcelain=v1", path).await;
        for (target, res) in [
            (&archive.diff_path, unstaged),
            (&archive.staged_path, staged),
            (&archive.status_path, status),
        ] {
            if let Err(e) = tokio::fs::write(target, res.stdout).await {
                warn!(path = %target.display(), error = %e, "failed to write archive file");
                return None;
            }
        }
        Some(archive)
    }
}

fn add_failed(result: &CommandResult) -> OpError {
    OpError::new(
        ErrorKind::WorktreeAddFailed,
        format!("git worktree add failed: {}", result.failure_reason()),
    )
    .with_command(result)
}

async fn canonical(path: &Path) -> PathBuf {
    tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| normalize(path))
}
