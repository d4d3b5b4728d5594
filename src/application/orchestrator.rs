//! Orchestrator wiring
//!
//! Builds the service graph from a [`Config`], starts the background loops
//! the config enables and serves the MCP stdio protocol until EOF or Ctrl-C.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::adapters::mcp::StdioServer;
use crate::adapters::shell::ShellCommandRunner;
use crate::domain::models::Config;
use crate::domain::ports::CommandRunner;
use crate::services::{
    AcceptanceEngine, AutoClaimConfig, AutoClaimLoop, DaemonHandle, ExecutionConfig, ExecutionLoop, PolicyService,
    RunService, StateStore, TaskLifecycle, WorkerRegistry, WorkflowService, WorktreeService,
};

/// Environment handed to worker subprocesses so agents can find shared files.
pub fn worker_env(config: &Config, base_dir: &Path) -> HashMap<String, String> {
    let abs = |p: &Path| base_dir.join(p).to_string_lossy().into_owned();
    HashMap::from([
        ("COWAI_WORKERS_FILE".to_string(), abs(&config.workers_file)),
        ("COWAI_ACTIVITY_LOG_FILE".to_string(), abs(&config.activity_log_file)),
        ("COWAI_STATE_FILE".to_string(), abs(&config.state_file)),
    ])
}

/// Every service, sharing one [`StateStore`].
pub struct Services {
    pub config: Config,
    pub base_dir: PathBuf,
    pub store: Arc<StateStore>,
    pub runner: Arc<dyn CommandRunner>,
    pub worktrees: Arc<WorktreeService>,
    pub policies: Arc<PolicyService>,
    pub lifecycle: Arc<TaskLifecycle>,
    pub acceptance: Arc<AcceptanceEngine>,
    pub registry: Arc<WorkerRegistry>,
    pub runs: Arc<RunService>,
    pub workflows: Arc<WorkflowService>,
}

impl Services {
    /// Services over a store that never touches the filesystem.
    pub fn in_memory(config: Config, base_dir: PathBuf) -> Self {
        Self::build(config, base_dir, Arc::new(StateStore::in_memory()))
    }

    /// Services over the file-backed store named by the config.
    pub async fn open(config: Config, base_dir: PathBuf) -> Self {
        let store = StateStore::open(
            base_dir.join(&config.activity_log_file),
            base_dir.join(&config.state_file),
        )
        .await;
        Self::build(config, base_dir, Arc::new(store))
    }

    fn build(config: Config, base_dir: PathBuf, store: Arc<StateStore>) -> Self {
        let runner: Arc<dyn CommandRunner> =
            Arc::new(ShellCommandRunner::new(Duration::from_millis(config.kill_grace_ms)));
        let worktrees = Arc::new(WorktreeService::new(Arc::clone(&runner)));
        let policies = Arc::new(PolicyService::new());
        let lifecycle = Arc::new(TaskLifecycle::new(Arc::clone(&store), Arc::clone(&worktrees)));
        let acceptance = Arc::new(AcceptanceEngine::new(
            Arc::clone(&store),
            Arc::clone(&worktrees),
            config.integration_target_branch.clone(),
        ));
        let registry = Arc::new(WorkerRegistry::new(
            Arc::clone(&store),
            Arc::clone(&policies),
            base_dir.clone(),
            &config.workers_file.to_string_lossy(),
            config.codex_cmd.clone(),
        ));
        let runs = Arc::new(RunService::new(
            Arc::clone(&store),
            Arc::clone(&runner),
            Arc::clone(&worktrees),
            Arc::clone(&policies),
            worker_env(&config, &base_dir),
        ));
        let workflows = Arc::new(WorkflowService::new(Arc::clone(&lifecycle)));

        Self {
            config,
            base_dir,
            store,
            runner,
            worktrees,
            policies,
            lifecycle,
            acceptance,
            registry,
            runs,
            workflows,
        }
    }

    pub fn auto_claim_config(&self) -> AutoClaimConfig {
        AutoClaimConfig {
            interval: Duration::from_millis(self.config.auto_claim_interval_ms),
            max_doing_per_agent: self.config.auto_claim_max_doing_per_agent,
        }
    }

    pub fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            interval: Duration::from_millis(self.config.auto_execute_interval_ms),
            command_timeout: Duration::from_millis(self.config.auto_execute_timeout_ms),
            heartbeat: Duration::from_millis(self.config.heartbeat_interval_ms),
            auto_verify: self.config.auto_verify_on_execute,
            auto_accept: self.config.auto_accept_on_execute,
        }
    }
}

/// Running orchestrator: services plus the background loops it started.
pub struct Orchestrator {
    services: Arc<Services>,
    daemons: Vec<DaemonHandle>,
}

impl Orchestrator {
    /// Open the store, preload workers and start the enabled loops.
    pub async fn start(config: Config, base_dir: PathBuf) -> Result<Self> {
        let services = Arc::new(Services::open(config, base_dir).await);
        let preloaded = services.registry.bootstrap().await;
        info!(workers = preloaded, "orchestrator starting");

        let mut daemons = Vec::new();
        if services.config.auto_claim {
            let auto_claim = AutoClaimLoop::new(Arc::clone(&services.lifecycle), services.auto_claim_config());
            daemons.push(auto_claim.spawn().await);
        }
        if services.config.auto_execute_enabled() {
            let execution = ExecutionLoop::new(
                Arc::clone(&services.store),
                Arc::clone(&services.runs),
                Arc::clone(&services.worktrees),
                Arc::clone(&services.acceptance),
                services.execution_config(),
            );
            daemons.push(execution.spawn().await);
        }
        Ok(Self { services, daemons })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Serve MCP over stdio until stdin closes or Ctrl-C, then stop the loops.
    pub async fn serve_stdio(self) -> Result<()> {
        let server = StdioServer::new(Arc::clone(&self.services));
        let served = tokio::select! {
            res = server.run() => res,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("interrupt received, shutting down");
                Ok(())
            }
        };
        self.shutdown().await;
        served
    }

    pub async fn shutdown(self) {
        for daemon in self.daemons {
            daemon.shutdown().await;
        }
        info!("orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_env_paths_are_absolute() {
        let env = worker_env(&Config::default(), Path::new("/srv/cowai"));
        assert_eq!(env["COWAI_STATE_FILE"], "/srv/cowai/logs/state.json");
        assert_eq!(env["COWAI_WORKERS_FILE"], "/srv/cowai/settings/workers.yaml");
        assert_eq!(env.len(), 3);
    }

    #[tokio::test]
    async fn test_start_without_loops_and_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = Orchestrator::start(Config::default(), dir.path().to_path_buf())
            .await
            .unwrap();
        assert!(orchestrator.daemons.is_empty());
        assert!(orchestrator.services().store.snapshot_path().is_some());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_with_loops() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            auto_claim: true,
            enable_workflow_execution: true,
            ..Config::default()
        };
        let orchestrator = Orchestrator::start(config, dir.path().to_path_buf()).await.unwrap();
        assert_eq!(orchestrator.daemons.len(), 2);
        let started = orchestrator
            .services()
            .store
            .read(|s| {
                s.activity_log.iter().any(|e| e.action == "auto_claim_loop_started")
                    && s.activity_log.iter().any(|e| e.action == "worker_execution_loop_started")
            })
            .await;
        assert!(started);
        orchestrator.shutdown().await;
    }
}
