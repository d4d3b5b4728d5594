//! Service layer: task lifecycle, worktrees, runs and the background loops.

pub mod acceptance;
pub mod auto_claim;
pub mod daemon;
pub mod execution_loop;
pub mod lifecycle;
pub mod policy_service;
pub mod review_queue;
pub mod run_service;
pub mod task_store;
pub mod worker_registry;
pub mod workflow_service;
pub mod worktree_service;

#[cfg(test)]
mod test_support;

pub use acceptance::AcceptanceEngine;
pub use auto_claim::{AutoClaimConfig, AutoClaimLoop};
pub use daemon::DaemonHandle;
pub use execution_loop::{ExecutionConfig, ExecutionLoop};
pub use lifecycle::TaskLifecycle;
pub use policy_service::PolicyService;
pub use run_service::RunService;
pub use task_store::{AppState, StateStore};
pub use worker_registry::WorkerRegistry;
pub use workflow_service::WorkflowService;
pub use worktree_service::WorktreeService;
