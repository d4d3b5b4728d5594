//! Common test utilities for integration tests
//!
//! Real git repositories in temp directories plus pre-wired services.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use cowai::domain::models::{Config, WorkerSpec};
use cowai::Services;
use tempfile::TempDir;

/// Run git in `dir`, panicking on failure.
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

/// A repository on `branch` with one commit.
pub fn init_repo_on(branch: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let repo = dir.path().join("repo");
    std::fs::create_dir_all(&repo).expect("mkdir");
    git(&repo, &["init", "-q", "-b", branch]);
    git(&repo, &["config", "user.email", "dev@example.com"]);
    git(&repo, &["config", "user.name", "Dev"]);
    git(&repo, &["config", "commit.gpgsign", "false"]);
    std::fs::write(repo.join("README.md"), "hello\n").expect("write");
    git(&repo, &["add", "-A"]);
    git(&repo, &["commit", "-q", "-m", "init"]);
    (dir, repo)
}

pub fn init_repo() -> (TempDir, PathBuf) {
    init_repo_on("main")
}

/// Write `.agent/policy.yaml` allowing `test` (passes) and `fail`.
pub fn write_policy(repo: &Path) {
    std::fs::create_dir_all(repo.join(".agent")).expect("mkdir");
    std::fs::write(
        repo.join(".agent/policy.yaml"),
        "commands:\n  test: test -f README.md\n  fail: exit 1\nsecurity:\n  allow: [test, fail]\n",
    )
    .expect("write policy");
}

/// Agent command that runs `script` and ignores the prompt arguments.
pub fn fake_agent(script: &str) -> String {
    format!("sh -c '{script}' codex")
}

/// In-memory services rooted at `base`.
pub fn services(base: &Path) -> Arc<Services> {
    Arc::new(Services::in_memory(Config::default(), base.to_path_buf()))
}

pub fn worker_spec(agent_id: &str, repo: &Path, role: Option<&str>) -> WorkerSpec {
    WorkerSpec {
        agent_id: agent_id.to_string(),
        repo_path: repo.to_string_lossy().into_owned(),
        codex_cmd: Some(fake_agent(&format!("echo change-by-{agent_id} >> README.md"))),
        role: role.map(str::to_string),
        ..WorkerSpec::default()
    }
}
