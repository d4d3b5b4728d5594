use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use crate::domain::models::{
    ActivityEvent, AgentRoleProfile, CommandResult, RunRecord, StoryWorkflow, Task, TaskRunMeta,
};

/// On-disk shape of `state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub last_command: Option<CommandResult>,
    #[serde(default)]
    pub agent_roles: Vec<AgentRoleProfile>,
    #[serde(default)]
    pub workflows: Vec<StoryWorkflow>,
    #[serde(default)]
    pub activity_log: Vec<ActivityEvent>,
    #[serde(default)]
    pub task_run_meta: HashMap<String, TaskRunMeta>,
    #[serde(default)]
    pub runs: Vec<RunRecord>,
}

/// Write the snapshot atomically: temp file in the same directory, then rename.
pub async fn save_snapshot(path: &Path, snapshot: &StateSnapshot) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(snapshot).context("Failed to serialize state snapshot")?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{}", std::process::id()));
    let tmp = std::path::PathBuf::from(tmp);

    fs::write(&tmp, json)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to rename snapshot into {}", path.display()))?;
    Ok(())
}

/// Load a snapshot. Missing and corrupt files both yield `None`.
pub async fn load_snapshot(path: &Path) -> Option<StateSnapshot> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read state snapshot");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring corrupt state snapshot");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs/state.json");
        let snapshot = StateSnapshot {
            tasks: vec![Task::with_id("t1", "first", None)],
            activity_log: vec![ActivityEvent::system("boot", "")],
            ..StateSnapshot::default()
        };

        save_snapshot(&path, &snapshot).await.unwrap();
        let loaded = load_snapshot(&path).await.unwrap();
        assert_eq!(loaded, snapshot);

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_load_as_none() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        assert!(load_snapshot(&path).await.is_none());
        std::fs::write(&path, "{ not json").unwrap();
        assert!(load_snapshot(&path).await.is_none());
    }

    #[tokio::test]
    async fn test_partial_snapshot_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"tasks": [], "lastCommand": null}"#).unwrap();
        let loaded = load_snapshot(&path).await.unwrap();
        assert!(loaded.workflows.is_empty());
        assert!(loaded.runs.is_empty());
    }
}
