//! Fixtures shared by service tests: throwaway git repositories and
//! pre-wired services.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;

use crate::adapters::shell::ShellCommandRunner;
use crate::domain::models::{AgentRoleProfile, Role, Worker, DEFAULT_WORKTREE_DIR};
use crate::domain::ports::CommandRunner;
use crate::services::task_store::StateStore;
use crate::services::worktree_service::WorktreeService;

pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git runs");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A repository on `main` with one commit and a committer identity.
pub fn init_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).expect("mkdir");
    git(&repo, &["init", "-q", "-b", "main"]);
    git(&repo, &["config", "user.email", "dev@example.com"]);
    git(&repo, &["config", "user.name", "Dev"]);
    git(&repo, &["config", "commit.gpgsign", "false"]);
    std::fs::write(repo.join("README.md"), "hello\n").expect("write");
    git(&repo, &["add", "-A"]);
    git(&repo, &["commit", "-q", "-m", "init"]);
    (dir, repo)
}

/// A worker whose agent command appends a line to README.md. The prompt
/// arguments appended by the run pipeline become ignored positional
/// parameters of the inner shell.
pub fn worker(agent_id: &str, repo: &Path) -> Worker {
    Worker {
        agent_id: agent_id.to_string(),
        repo_path: repo.to_path_buf(),
        worktree_root: repo.join(DEFAULT_WORKTREE_DIR),
        codex_cmd: fake_agent(&format!("echo change-by-{agent_id} >> README.md")),
    }
}

/// Agent command that runs `script` and ignores its arguments.
pub fn fake_agent(script: &str) -> String {
    format!("sh -c '{script}' codex")
}

pub fn profile(agent_id: &str, kind: Role) -> AgentRoleProfile {
    AgentRoleProfile {
        agent_id: agent_id.to_string(),
        role: kind.as_str().to_string(),
        kind,
        is_pm: kind == Role::Pm,
        focus: None,
        personality: None,
        verify_command_key: None,
    }
}

pub fn shell() -> Arc<dyn CommandRunner> {
    Arc::new(ShellCommandRunner::default())
}

pub fn worktrees() -> Arc<WorktreeService> {
    Arc::new(WorktreeService::new(shell()))
}

/// Store seeded with the given workers plus a tech lead and a PM profile.
pub async fn store_with(workers: &[Worker]) -> Arc<StateStore> {
    let store = Arc::new(StateStore::in_memory());
    let workers = workers.to_vec();
    store
        .mutate(move |state, _| {
            for w in workers {
                state.upsert_worker(w);
            }
            for p in [profile("TL", Role::TechLead), profile("PM", Role::Pm)] {
                state.agent_roles.insert(p.agent_id.clone(), p);
            }
        })
        .await;
    store
}
