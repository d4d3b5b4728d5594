//! Worker Registry
//!
//! Registers workers, loads role profiles from `.agent/roles.md` frontmatter
//! and (re)loads the `workers.yaml` roster.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::domain::models::{
    ActivityEvent, AgentRoleProfile, RoleSpec, Worker, WorkerSpec, WorkersFile, DEFAULT_WORKTREE_DIR,
};
use crate::domain::{ErrorKind, OpError, OpResult};
use crate::services::policy_service::PolicyService;
use crate::services::task_store::{AppState, StateStore};

/// Roles file location relative to a repository root.
pub const ROLES_FILE: &str = ".agent/roles.md";

#[derive(Debug, Error)]
pub enum RolesFileError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("roles.md frontmatter is missing")]
    MissingFrontmatter,
    #[error("invalid roles frontmatter: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("No valid agents found in roles.md frontmatter")]
    NoAgents,
}

#[derive(Debug, Default, Deserialize)]
struct RolesDoc {
    #[serde(default)]
    agents: Vec<RoleSpec>,
}

/// Body of a leading `---` fenced block, ignoring a byte order mark.
fn frontmatter(text: &str) -> Option<&str> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let rest = text.strip_prefix("---\n")?;
    if let Some(body) = rest.strip_prefix("---") {
        // Empty frontmatter
        return (body.is_empty() || body.starts_with('\n')).then_some("");
    }
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches('\n') == "---" && offset > 0 {
            return Some(rest[..offset].trim_end_matches('\n'));
        }
        offset += line.len();
    }
    None
}

/// Parse role profiles out of a roles markdown document.
///
/// Entries without an `agentId`, or with neither a label nor an explicit
/// kind, are skipped.
pub fn parse_roles_markdown(text: &str) -> Result<Vec<AgentRoleProfile>, RolesFileError> {
    let body = frontmatter(text).ok_or(RolesFileError::MissingFrontmatter)?;
    let doc: RolesDoc = if body.trim().is_empty() {
        RolesDoc::default()
    } else {
        serde_yaml::from_str(body)?
    };
    let roles: Vec<AgentRoleProfile> = doc
        .agents
        .into_iter()
        .filter(|a| {
            !a.agent_id.trim().is_empty()
                && (!a.role.trim().is_empty() || a.kind.is_some() || a.is_pm == Some(true))
        })
        .map(AgentRoleProfile::from)
        .collect();
    if roles.is_empty() {
        return Err(RolesFileError::NoAgents);
    }
    Ok(roles)
}

fn resolve_against(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

/// Roles file path: `<repo>/.agent/roles.md` unless `file_path` is given.
pub fn roles_file_path(repo_path: &Path, file_path: Option<&str>) -> PathBuf {
    match file_path.map(str::trim).filter(|f| !f.is_empty()) {
        None => repo_path.join(ROLES_FILE),
        Some(f) => resolve_against(repo_path, f),
    }
}

pub async fn read_roles_file(path: &Path) -> Result<Vec<AgentRoleProfile>, RolesFileError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| RolesFileError::Read {
            path: path.display().to_string(),
            source,
        })?;
    parse_roles_markdown(&text)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredWorker {
    #[serde(flatten)]
    pub worker: Worker,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<AgentRoleProfile>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadedRoles {
    pub source_path: PathBuf,
    pub loaded: Vec<AgentRoleProfile>,
    pub agent_roles: Vec<AgentRoleProfile>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BeforeAfter {
    pub before: usize,
    pub after: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadReport {
    pub path: PathBuf,
    pub workers: BeforeAfter,
    pub roles: BeforeAfter,
    pub policy_cache: BeforeAfter,
}

/// Roster loaded from a workers file.
#[derive(Debug, Clone)]
pub struct WorkerRoster {
    pub path: PathBuf,
    pub workers: Vec<Worker>,
    pub roles: Vec<AgentRoleProfile>,
}

pub struct WorkerRegistry {
    store: Arc<StateStore>,
    policies: Arc<PolicyService>,
    /// Base for relative repo and workers-file paths
    base_dir: PathBuf,
    workers_file: PathBuf,
    default_codex_cmd: String,
}

impl WorkerRegistry {
    pub fn new(
        store: Arc<StateStore>,
        policies: Arc<PolicyService>,
        base_dir: PathBuf,
        workers_file: &str,
        default_codex_cmd: impl Into<String>,
    ) -> Self {
        let workers_file = resolve_against(&base_dir, workers_file);
        Self {
            store,
            policies,
            base_dir,
            workers_file,
            default_codex_cmd: default_codex_cmd.into(),
        }
    }

    /// Build a worker from a spec, creating its worktree root.
    async fn materialize(&self, spec: &WorkerSpec) -> anyhow::Result<(Worker, Option<AgentRoleProfile>)> {
        anyhow::ensure!(!spec.agent_id.trim().is_empty(), "agentId is required");
        anyhow::ensure!(!spec.repo_path.trim().is_empty(), "repoPath is required");

        let repo_path = resolve_against(&self.base_dir, spec.repo_path.trim());
        let worktree_root = repo_path.join(
            spec.worktree_dir_name
                .as_deref()
                .filter(|d| !d.trim().is_empty())
                .unwrap_or(DEFAULT_WORKTREE_DIR),
        );
        tokio::fs::create_dir_all(&worktree_root)
            .await
            .with_context(|| format!("failed to create worktree root {}", worktree_root.display()))?;

        let worker = Worker {
            agent_id: spec.agent_id.trim().to_string(),
            repo_path,
            worktree_root,
            codex_cmd: spec
                .codex_cmd
                .clone()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| self.default_codex_cmd.clone()),
        };

        let has_role = spec.role.as_deref().is_some_and(|r| !r.trim().is_empty())
            || spec.kind.is_some()
            || spec.is_pm == Some(true);
        let role = has_role.then(|| {
            AgentRoleProfile::from(RoleSpec {
                agent_id: worker.agent_id.clone(),
                role: spec.role.clone().unwrap_or_default(),
                kind: spec.kind,
                is_pm: spec.is_pm,
                focus: spec.focus.clone(),
                personality: spec.personality.clone(),
                verify_command_key: spec.verify_command_key.clone(),
            })
        });
        Ok((worker, role))
    }

    /// Register (or replace) a worker.
    #[instrument(skip(self, spec), fields(agent_id = %spec.agent_id))]
    pub async fn register(&self, spec: WorkerSpec) -> OpResult<RegisteredWorker> {
        let (worker, role) = self
            .materialize(&spec)
            .await
            .map_err(|e| OpError::invalid_argument(format!("{e:#}")))?;

        let registered = RegisteredWorker {
            worker: worker.clone(),
            role: role.clone(),
        };
        self.store
            .mutate(move |state, events| {
                events.push(
                    ActivityEvent::system(
                        "worker_registered",
                        format!("{} repo={}", worker.agent_id, worker.repo_path.display()),
                    )
                    .with_agent(worker.agent_id.clone()),
                );
                if let Some(role) = role {
                    state.agent_roles.insert(role.agent_id.clone(), role);
                }
                state.upsert_worker(worker);
            })
            .await;
        info!(repo = %registered.worker.repo_path.display(), "worker registered");
        Ok(registered)
    }

    /// Load role profiles from a roles markdown file.
    ///
    /// Without `repo_path` the first registered worker's repository is used.
    #[instrument(skip(self))]
    pub async fn load_roles(
        &self,
        repo_path: Option<&str>,
        file_path: Option<&str>,
        replace_all: bool,
    ) -> OpResult<LoadedRoles> {
        let repo = match repo_path.map(str::trim).filter(|r| !r.is_empty()) {
            Some(r) => resolve_against(&self.base_dir, r),
            None => self
                .store
                .read(|s| s.workers.first().map(|w| w.repo_path.clone()))
                .await
                .ok_or_else(|| {
                    OpError::new(
                        ErrorKind::RepoPathRequired,
                        "repoPath is required when no worker is registered",
                    )
                })?,
        };
        let path = roles_file_path(&repo, file_path);
        let loaded = read_roles_file(&path).await.map_err(|e| {
            OpError::new(ErrorKind::LoadRolesFailed, format!("failed to load roles: {e}"))
                .with_detail(json!({ "path": path }))
        })?;

        let agent_roles = self
            .store
            .mutate(|state, events| {
                if replace_all {
                    state.agent_roles.clear();
                }
                for role in &loaded {
                    state.agent_roles.insert(role.agent_id.clone(), role.clone());
                }
                events.push(ActivityEvent::system(
                    "load_roles_md",
                    format!("loaded {} role(s) from {}", loaded.len(), path.display()),
                ));
                state.agent_roles.values().cloned().collect()
            })
            .await;
        Ok(LoadedRoles {
            source_path: path,
            loaded,
            agent_roles,
        })
    }

    /// Parse a workers file and materialize its entries.
    ///
    /// Entries missing `agentId` or `repoPath` are skipped.
    pub async fn read_roster(&self, file: Option<&str>) -> anyhow::Result<WorkerRoster> {
        let path = match file.map(str::trim).filter(|f| !f.is_empty()) {
            Some(f) => resolve_against(&self.base_dir, f),
            None => self.workers_file.clone(),
        };
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read workers file {}", path.display()))?;
        let parsed: WorkersFile = if text.trim().is_empty() {
            WorkersFile::default()
        } else {
            serde_yaml::from_str(&text).with_context(|| format!("invalid workers file {}", path.display()))?
        };

        let mut workers = Vec::new();
        let mut roles = Vec::new();
        for spec in parsed.workers {
            if spec.agent_id.trim().is_empty() || spec.repo_path.trim().is_empty() {
                debug!("skipping incomplete workers.yaml entry");
                continue;
            }
            let (worker, role) = self.materialize(&spec).await?;
            workers.push(worker);
            roles.extend(role);
        }
        Ok(WorkerRoster { path, workers, roles })
    }

    fn install(roster: &WorkerRoster, state: &mut AppState, events: &mut Vec<ActivityEvent>) {
        for worker in &roster.workers {
            state.upsert_worker(worker.clone());
        }
        if !roster.roles.is_empty() {
            state.agent_roles.clear();
            for role in &roster.roles {
                state.agent_roles.insert(role.agent_id.clone(), role.clone());
            }
        }
        events.push(ActivityEvent::system(
            "workers_loaded",
            format!(
                "{} worker(s), {} role(s) from {}",
                roster.workers.len(),
                roster.roles.len(),
                roster.path.display()
            ),
        ));
    }

    /// Load the default workers file if it exists. Failures are logged.
    pub async fn bootstrap(&self) -> usize {
        if !self.workers_file.exists() {
            debug!(path = %self.workers_file.display(), "no workers file, skipping preload");
            return 0;
        }
        match self.read_roster(None).await {
            Ok(roster) => {
                let count = roster.workers.len();
                self.store
                    .mutate(|state, events| Self::install(&roster, state, events))
                    .await;
                info!(workers = count, path = %roster.path.display(), "workers preloaded");
                count
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "failed to preload workers file");
                0
            }
        }
    }

    /// Re-read the workers file, optionally resetting workers, roles and
    /// the policy cache first.
    #[instrument(skip(self))]
    pub async fn reload(
        &self,
        workers_file: Option<&str>,
        reset_workers: bool,
        reset_roles: bool,
        clear_policy_cache: bool,
    ) -> OpResult<ReloadReport> {
        let (workers_before, roles_before) = self
            .store
            .read(|s| (s.workers.len(), s.agent_roles.len()))
            .await;
        let policy_before = self.policies.cached_count().await;

        let roster = self
            .read_roster(workers_file)
            .await
            .map_err(|e| OpError::new(ErrorKind::ReloadFailed, format!("reload failed: {e:#}")))?;

        if clear_policy_cache {
            self.policies.clear().await;
        }
        let policy_after = self.policies.cached_count().await;

        let (workers_after, roles_after) = self
            .store
            .mutate(|state, events| {
                if reset_workers {
                    state.workers.clear();
                }
                if reset_roles {
                    state.agent_roles.clear();
                }
                Self::install(&roster, state, events);
                events.push(ActivityEvent::system(
                    "config_reloaded",
                    format!(
                        "workers={}, roles={}, policyCacheCleared={clear_policy_cache}",
                        state.workers.len(),
                        state.agent_roles.len()
                    ),
                ));
                (state.workers.len(), state.agent_roles.len())
            })
            .await;

        Ok(ReloadReport {
            path: roster.path,
            workers: BeforeAfter {
                before: workers_before,
                after: workers_after,
            },
            roles: BeforeAfter {
                before: roles_before,
                after: roles_after,
            },
            policy_cache: BeforeAfter {
                before: policy_before,
                after: policy_after,
            },
        })
    }
}
