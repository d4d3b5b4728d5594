//! Auto-claim loop.
//!
//! Every interval, each worker below its `doing` cap claims its next
//! assigned task. Rework-flagged tasks come first so the claim guard never
//! trips on them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::domain::models::{ActivityEvent, TaskType};
use crate::services::daemon::DaemonHandle;
use crate::services::lifecycle::TaskLifecycle;
use crate::services::task_store::AppState;

#[derive(Debug, Clone)]
pub struct AutoClaimConfig {
    pub interval: Duration,
    pub max_doing_per_agent: usize,
}

impl Default for AutoClaimConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(5_000),
            max_doing_per_agent: 1,
        }
    }
}

/// Next task `agent_id` should claim, if any.
pub fn pick_next_task(state: &AppState, agent_id: &str) -> Option<String> {
    let mut candidates = state.tasks.iter().filter(|t| {
        t.status.is_claimable()
            && t.kind() == TaskType::Implementation
            && t.assignee.as_deref() == Some(agent_id)
    });
    let first = candidates.clone().next()?;
    let chosen = candidates.find(|t| t.rework_requested).unwrap_or(first);
    Some(chosen.id.clone())
}

pub struct AutoClaimLoop {
    lifecycle: Arc<TaskLifecycle>,
    config: AutoClaimConfig,
}

impl AutoClaimLoop {
    pub fn new(lifecycle: Arc<TaskLifecycle>, config: AutoClaimConfig) -> Self {
        Self { lifecycle, config }
    }

    /// One pass over all workers. Returns the ids of claimed tasks.
    pub async fn tick(&self) -> Vec<String> {
        let store = self.lifecycle.store();
        let max = self.config.max_doing_per_agent;
        let picks: Vec<(String, String)> = store
            .read(|state| {
                state
                    .workers
                    .iter()
                    .filter(|w| state.doing_count(&w.agent_id) < max)
                    .filter_map(|w| pick_next_task(state, &w.agent_id).map(|t| (w.agent_id.clone(), t)))
                    .collect()
            })
            .await;

        let mut claimed = Vec::new();
        for (agent_id, task_id) in picks {
            match self.lifecycle.claim(&task_id, &agent_id).await {
                Ok(outcome) => {
                    debug!(task_id = %task_id, agent_id = %agent_id, "auto-claimed");
                    claimed.push(outcome.task.id);
                }
                Err(e) => {
                    warn!(task_id = %task_id, agent_id = %agent_id, error = %e, "auto-claim failed");
                    store
                        .log(
                            ActivityEvent::system("auto_claim_failed", format!("{task_id} for {agent_id}: {}", e.kind))
                                .with_agent(agent_id),
                        )
                        .await;
                }
            }
        }
        claimed
    }

    /// Spawn the loop. Ticks never overlap: a slow pass delays the next one.
    pub async fn spawn(self) -> DaemonHandle {
        let stop_flag = Arc::new(AtomicBool::new(false));
        self.lifecycle
            .store()
            .log(ActivityEvent::system(
                "auto_claim_loop_started",
                format!(
                    "intervalMs={}, maxDoingPerAgent={}",
                    self.config.interval.as_millis(),
                    self.config.max_doing_per_agent
                ),
            ))
            .await;
        info!(interval = ?self.config.interval, "auto-claim loop started");

        let flag = Arc::clone(&stop_flag);
        let join = tokio::spawn(async move {
            let mut timer = interval(self.config.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                if flag.load(Ordering::Acquire) {
                    break;
                }
                self.tick().await;
            }
            debug!("auto-claim loop stopped");
        });
        DaemonHandle::new(stop_flag, join)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Task, TaskStatus};
    use crate::services::test_support::{init_repo, store_with, worker, worktrees};

    fn task(id: &str, assignee: &str, status: TaskStatus, rework: bool) -> Task {
        let mut t = Task::with_id(id, id, None);
        t.assignee = Some(assignee.to_string());
        t.status = status;
        t.rework_requested = rework;
        t
    }

    #[test]
    fn test_pick_prefers_rework() {
        let mut state = AppState::default();
        state.tasks.push(task("A", "W1", TaskStatus::Todo, false));
        state.tasks.push(task("B", "W1", TaskStatus::Rejected, true));
        state.tasks.push(task("C", "W2", TaskStatus::Todo, true));
        assert_eq!(pick_next_task(&state, "W1").as_deref(), Some("B"));
        assert_eq!(pick_next_task(&state, "W2").as_deref(), Some("C"));
        assert_eq!(pick_next_task(&state, "W3"), None);
    }

    #[test]
    fn test_pick_skips_review_tasks() {
        let mut state = AppState::default();
        let mut review = task("R", "W1", TaskStatus::Todo, false);
        review.task_type = Some(TaskType::TlReview);
        state.tasks.push(review);
        assert_eq!(pick_next_task(&state, "W1"), None);
    }

    #[tokio::test]
    async fn test_tick_respects_doing_cap() {
        let (_dir, repo) = init_repo();
        let store = store_with(&[worker("W1", &repo)]).await;
        store
            .mutate(|s, _| {
                s.tasks.push(task("A", "W1", TaskStatus::Todo, false));
                s.tasks.push(task("B", "W1", TaskStatus::Todo, false));
            })
            .await;
        let lifecycle = Arc::new(TaskLifecycle::new(Arc::clone(&store), worktrees()));
        let auto = AutoClaimLoop::new(lifecycle, AutoClaimConfig::default());

        assert_eq!(auto.tick().await, vec!["A".to_string()]);
        assert!(auto.tick().await.is_empty());
        assert_eq!(store.read(|s| s.doing_count("W1")).await, 1);
    }

    #[tokio::test]
    async fn test_tick_logs_failures() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = store_with(&[worker("W1", dir.path())]).await;
        store
            .mutate(|s, _| s.tasks.push(task("A", "W1", TaskStatus::Todo, false)))
            .await;
        let lifecycle = Arc::new(TaskLifecycle::new(Arc::clone(&store), worktrees()));
        let auto = AutoClaimLoop::new(lifecycle, AutoClaimConfig::default());

        assert!(auto.tick().await.is_empty());
        let failed = store
            .read(|s| s.activity_log.iter().any(|e| e.action == "auto_claim_failed"))
            .await;
        assert!(failed);
    }
}
