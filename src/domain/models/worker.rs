//! Worker registration model.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::models::role::Role;

/// Default worktree directory name under a worker's repository.
pub const DEFAULT_WORKTREE_DIR: &str = ".worktrees";

/// A registered execution agent bound to one repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub agent_id: String,
    /// Absolute repository path
    pub repo_path: PathBuf,
    /// Directory holding this worker's task worktrees
    pub worktree_root: PathBuf,
    /// Command used to invoke the coding agent
    pub codex_cmd: String,
}

/// Registration input, shared by the `registerWorker` tool and `workers.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub repo_path: String,
    #[serde(default)]
    pub worktree_dir_name: Option<String>,
    #[serde(default)]
    pub codex_cmd: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub kind: Option<Role>,
    #[serde(default)]
    pub is_pm: Option<bool>,
    #[serde(default)]
    pub focus: Option<String>,
    #[serde(default)]
    pub personality: Option<String>,
    #[serde(default)]
    pub verify_command_key: Option<String>,
}

/// Top-level shape of `workers.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkersFile {
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workers_file_parses_camel_case() {
        let yaml = r"
workers:
  - agentId: B1
    repoPath: /tmp/repo
    role: developer
    verifyCommandKey: test
  - agentId: A
    repoPath: /tmp/repo
    isPm: true
";
        let file: WorkersFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.workers.len(), 2);
        assert_eq!(file.workers[0].agent_id, "B1");
        assert_eq!(file.workers[0].verify_command_key.as_deref(), Some("test"));
        assert_eq!(file.workers[1].is_pm, Some(true));
        assert!(file.workers[1].worktree_dir_name.is_none());
    }
}
