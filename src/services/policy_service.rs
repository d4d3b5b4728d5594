//! Policy Resolver
//!
//! Loads `.agent/policy.yaml` per repository and maps symbolic command keys
//! onto the concrete shell commands the policy approves.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::domain::models::RepoPolicy;
use crate::domain::PolicyError;

/// Policy file location relative to a repository root.
pub const POLICY_FILE: &str = ".agent/policy.yaml";

/// A command resolved from a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub key: String,
    pub command: String,
    /// True when the key was passed through as a raw command
    pub raw: bool,
}

/// Map `key` to a concrete command.
///
/// Named commands must also appear in the allowlist when one is configured.
/// Anything else is only passed through when the policy sets
/// `forbid_raw_command: false`.
pub fn resolve_command(policy: &RepoPolicy, key: &str) -> Result<ResolvedCommand, PolicyError> {
    if let Some(command) = policy.commands.get(key) {
        if let Some(allow) = &policy.security.allow {
            if !allow.iter().any(|a| a == key) {
                return Err(PolicyError::NotAllowed(key.to_string()));
            }
        }
        return Ok(ResolvedCommand {
            key: key.to_string(),
            command: command.clone(),
            raw: false,
        });
    }

    if policy.security.forbid_raw_command {
        return Err(PolicyError::RawForbidden(key.to_string()));
    }
    Ok(ResolvedCommand {
        key: key.to_string(),
        command: key.to_string(),
        raw: true,
    })
}

/// Cached policy loader.
#[derive(Default)]
pub struct PolicyService {
    cache: RwLock<HashMap<PathBuf, Arc<RepoPolicy>>>,
}

impl PolicyService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the policy for a repository, from cache unless `refresh` is set.
    ///
    /// An empty policy file yields the default policy (raw commands forbidden).
    #[instrument(skip(self), fields(repo = %repo_path.display()))]
    pub async fn load(&self, repo_path: &Path, refresh: bool) -> Result<Arc<RepoPolicy>, PolicyError> {
        if !refresh {
            if let Some(policy) = self.cache.read().await.get(repo_path) {
                return Ok(Arc::clone(policy));
            }
        }

        let path = repo_path.join(POLICY_FILE);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| PolicyError::Load {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let policy: RepoPolicy = if text.trim().is_empty() {
            RepoPolicy::default()
        } else {
            serde_yaml::from_str(&text).map_err(|e| PolicyError::Load {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        };

        debug!(commands = policy.commands.len(), "policy loaded");
        let policy = Arc::new(policy);
        self.cache
            .write()
            .await
            .insert(repo_path.to_path_buf(), Arc::clone(&policy));
        Ok(policy)
    }

    /// Load the repository policy and resolve `key` against it.
    pub async fn resolve(&self, repo_path: &Path, key: &str) -> Result<ResolvedCommand, PolicyError> {
        let policy = self.load(repo_path, false).await?;
        resolve_command(&policy, key)
    }

    /// Number of cached policies.
    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Drop every cached policy. Returns how many were cached.
    pub async fn clear(&self) -> usize {
        let mut cache = self.cache.write().await;
        let n = cache.len();
        cache.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::SecurityPolicy;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn policy(allow: Option<Vec<&str>>, forbid_raw: bool) -> RepoPolicy {
        RepoPolicy {
            project: None,
            commands: BTreeMap::from([("test".to_string(), "npm test".to_string())]),
            security: SecurityPolicy {
                allow: allow.map(|a| a.into_iter().map(String::from).collect()),
                forbid_raw_command: forbid_raw,
            },
        }
    }

    #[test]
    fn test_named_command_resolves() {
        let resolved = resolve_command(&policy(Some(vec!["test"]), true), "test").unwrap();
        assert_eq!(resolved.command, "npm test");
        assert!(!resolved.raw);
    }

    #[test]
    fn test_unknown_key_rejected_when_raw_forbidden() {
        let err = resolve_command(&policy(Some(vec!["test"]), true), "lint").unwrap_err();
        assert_eq!(err, PolicyError::RawForbidden("lint".into()));
    }

    #[test]
    fn test_named_command_outside_allowlist_rejected() {
        let err = resolve_command(&policy(Some(vec!["build"]), true), "test").unwrap_err();
        assert_eq!(err, PolicyError::NotAllowed("test".into()));
    }

    #[test]
    fn test_raw_command_allowed_when_permitted() {
        let resolved = resolve_command(&policy(None, false), "echo hi").unwrap();
        assert_eq!(resolved.command, "echo hi");
        assert!(resolved.raw);
    }

    #[tokio::test]
    async fn test_load_caches_until_refresh() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".agent")).unwrap();
        let file = dir.path().join(POLICY_FILE);
        std::fs::write(&file, "commands:\n  test: cargo test\n").unwrap();

        let service = PolicyService::new();
        let first = service.load(dir.path(), false).await.unwrap();
        assert_eq!(first.commands["test"], "cargo test");

        std::fs::write(&file, "commands:\n  test: cargo nextest run\n").unwrap();
        let cached = service.load(dir.path(), false).await.unwrap();
        assert_eq!(cached.commands["test"], "cargo test");

        let refreshed = service.load(dir.path(), true).await.unwrap();
        assert_eq!(refreshed.commands["test"], "cargo nextest run");

        assert_eq!(service.clear().await, 1);
    }

    #[tokio::test]
    async fn test_missing_policy_is_load_error() {
        let dir = TempDir::new().unwrap();
        let err = PolicyService::new().resolve(dir.path(), "test").await.unwrap_err();
        assert!(matches!(err, PolicyError::Load { .. }));
    }
}
