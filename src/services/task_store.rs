//! Task Store
//!
//! Single owner of every mutable collection: tasks, workers, role profiles,
//! workflows, runs, run metadata and the bounded activity log.
//!
//! All mutations go through [`StateStore::mutate`], which runs a synchronous
//! closure under the write lock. Activity events emitted by the closure are
//! appended to the in-memory log inside the same critical section and then
//! persisted (ndjson append plus atomic snapshot) after the lock is released.
//! Persistence is best-effort; failures are counted and logged, never
//! propagated.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::domain::models::{
    ActivityEvent, ActivityFilter, AgentRoleProfile, CommandResult, Role, RunRecord, StoryWorkflow,
    Task, TaskRunMeta, TaskStatus, Worker, ACTIVITY_LOG_CAP,
};
use crate::domain::{OpError, OpResult};
use crate::infrastructure::persistence::{self, StateSnapshot};

/// All in-memory state.
#[derive(Debug, Default)]
pub struct AppState {
    pub tasks: Vec<Task>,
    /// Registration order
    pub workers: Vec<Worker>,
    /// Keyed by agent id so iteration order is the routing tie-break
    pub agent_roles: BTreeMap<String, AgentRoleProfile>,
    pub workflows: Vec<StoryWorkflow>,
    pub runs: HashMap<String, RunRecord>,
    pub task_run_meta: HashMap<String, TaskRunMeta>,
    pub activity_log: VecDeque<ActivityEvent>,
    pub last_command: Option<CommandResult>,
}

impl AppState {
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// Look up a task or fail with `TASK_NOT_FOUND`.
    pub fn require_task(&self, task_id: &str) -> OpResult<&Task> {
        self.task(task_id).ok_or_else(|| OpError::task_not_found(task_id))
    }

    pub fn require_task_mut(&mut self, task_id: &str) -> OpResult<&mut Task> {
        self.task_mut(task_id).ok_or_else(|| OpError::task_not_found(task_id))
    }

    pub fn worker(&self, agent_id: &str) -> Option<&Worker> {
        self.workers.iter().find(|w| w.agent_id == agent_id)
    }

    pub fn require_worker(&self, agent_id: &str) -> OpResult<&Worker> {
        self.worker(agent_id).ok_or_else(|| OpError::worker_not_found(agent_id))
    }

    /// Insert or replace a worker, keeping registration order for new ids.
    pub fn upsert_worker(&mut self, worker: Worker) {
        match self.workers.iter_mut().find(|w| w.agent_id == worker.agent_id) {
            Some(existing) => *existing = worker,
            None => self.workers.push(worker),
        }
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<&StoryWorkflow> {
        self.workflows.iter().find(|w| w.id == workflow_id)
    }

    pub fn workflow_mut(&mut self, workflow_id: &str) -> Option<&mut StoryWorkflow> {
        self.workflows.iter_mut().find(|w| w.id == workflow_id)
    }

    /// Agent routed for a role.
    ///
    /// PM routing prefers an explicit `isPm` profile. Otherwise the lowest
    /// agent id with the requested kind wins.
    pub fn agent_for_role(&self, role: Role) -> Option<&AgentRoleProfile> {
        if role == Role::Pm {
            if let Some(pm) = self.agent_roles.values().find(|p| p.is_pm) {
                return Some(pm);
            }
        }
        self.agent_roles.values().find(|p| p.kind == role)
    }

    /// Number of `doing` tasks assigned to an agent.
    pub fn doing_count(&self, agent_id: &str) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Doing && t.assignee.as_deref() == Some(agent_id))
            .count()
    }

    fn push_event(&mut self, event: ActivityEvent) {
        self.activity_log.push_back(event);
        while self.activity_log.len() > ACTIVITY_LOG_CAP {
            self.activity_log.pop_front();
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        let mut runs: Vec<RunRecord> = self.runs.values().cloned().collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        StateSnapshot {
            tasks: self.tasks.clone(),
            last_command: self.last_command.clone(),
            agent_roles: self.agent_roles.values().cloned().collect(),
            workflows: self.workflows.clone(),
            activity_log: self.activity_log.iter().cloned().collect(),
            task_run_meta: self.task_run_meta.clone(),
            runs,
        }
    }

    fn restore(snapshot: StateSnapshot) -> Self {
        let mut activity_log: VecDeque<ActivityEvent> = snapshot.activity_log.into();
        while activity_log.len() > ACTIVITY_LOG_CAP {
            activity_log.pop_front();
        }
        Self {
            tasks: snapshot.tasks,
            workers: Vec::new(),
            agent_roles: snapshot
                .agent_roles
                .into_iter()
                .map(|p| (p.agent_id.clone(), p))
                .collect(),
            workflows: snapshot.workflows,
            runs: snapshot
                .runs
                .into_iter()
                .map(|r| (r.run_id.clone(), r))
                .collect(),
            task_run_meta: snapshot.task_run_meta,
            activity_log,
            last_command: snapshot.last_command,
        }
    }
}

/// Persistence health counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceHealth {
    pub activity_append_failures: u64,
    pub snapshot_failures: u64,
}

/// Owner of [`AppState`].
pub struct StateStore {
    state: RwLock<AppState>,
    activity_path: Option<PathBuf>,
    snapshot_path: Option<PathBuf>,
    persist_lock: Mutex<()>,
    activity_append_failures: AtomicU64,
    snapshot_failures: AtomicU64,
}

impl StateStore {
    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self::build(AppState::default(), None, None)
    }

    /// Open a file-backed store, rehydrating from the snapshot when present.
    pub async fn open(activity_path: PathBuf, snapshot_path: PathBuf) -> Self {
        let state = match persistence::load_snapshot(&snapshot_path).await {
            Some(snapshot) => {
                debug!(
                    path = %snapshot_path.display(),
                    tasks = snapshot.tasks.len(),
                    "rehydrated state snapshot"
                );
                AppState::restore(snapshot)
            }
            None => AppState::default(),
        };
        Self::build(state, Some(activity_path), Some(snapshot_path))
    }

    fn build(state: AppState, activity_path: Option<PathBuf>, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            state: RwLock::new(state),
            activity_path,
            snapshot_path,
            persist_lock: Mutex::new(()),
            activity_append_failures: AtomicU64::new(0),
            snapshot_failures: AtomicU64::new(0),
        }
    }

    pub fn activity_path(&self) -> Option<&PathBuf> {
        self.activity_path.as_ref()
    }

    pub fn snapshot_path(&self) -> Option<&PathBuf> {
        self.snapshot_path.as_ref()
    }

    /// Run a read-only closure against the state.
    pub async fn read<R>(&self, f: impl FnOnce(&AppState) -> R) -> R {
        let state = self.state.read().await;
        f(&state)
    }

    /// Run a mutation as one critical section, then persist.
    ///
    /// The closure must not block. Events it pushes are logged even when it
    /// returns an error value, so failed guards can still leave an audit
    /// trail.
    pub async fn mutate<R>(&self, f: impl FnOnce(&mut AppState, &mut Vec<ActivityEvent>) -> R) -> R {
        let mut state = self.state.write().await;
        let mut events = Vec::new();
        let result = f(&mut state, &mut events);
        for event in &events {
            state.push_event(event.clone());
        }
        let snapshot = self.snapshot_path.as_ref().map(|_| state.snapshot());

        // Taking the persist lock before releasing the state lock keeps
        // persisted order equal to mutation order.
        let _persist = self.persist_lock.lock().await;
        drop(state);

        self.persist(&events, snapshot.as_ref()).await;
        result
    }

    /// Record a single activity event.
    pub async fn log(&self, event: ActivityEvent) {
        self.mutate(|_, events| events.push(event)).await;
    }

    /// In-memory activity slice, newest last.
    pub async fn activity(&self, filter: &ActivityFilter, limit: usize) -> Vec<ActivityEvent> {
        self.read(|state| {
            let matching: Vec<&ActivityEvent> =
                state.activity_log.iter().filter(|e| filter.matches(e)).collect();
            let start = matching.len().saturating_sub(limit);
            matching[start..].iter().map(|e| (*e).clone()).collect()
        })
        .await
    }

    pub fn health(&self) -> PersistenceHealth {
        PersistenceHealth {
            activity_append_failures: self.activity_append_failures.load(Ordering::Relaxed),
            snapshot_failures: self.snapshot_failures.load(Ordering::Relaxed),
        }
    }

    async fn persist(&self, events: &[ActivityEvent], snapshot: Option<&StateSnapshot>) {
        if let Some(path) = &self.activity_path {
            if let Err(e) = persistence::append_events(path, events).await {
                let failures = self.activity_append_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(path = %path.display(), error = %e, failures, "activity log append failed");
            }
        }
        if let (Some(path), Some(snapshot)) = (&self.snapshot_path, snapshot) {
            if let Err(e) = persistence::save_snapshot(path, snapshot).await {
                let failures = self.snapshot_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(path = %path.display(), error = %e, failures, "state snapshot failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn profile(agent_id: &str, kind: Role, is_pm: bool) -> AgentRoleProfile {
        AgentRoleProfile {
            agent_id: agent_id.into(),
            role: kind.as_str().into(),
            kind,
            is_pm,
            focus: None,
            personality: None,
            verify_command_key: None,
        }
    }

    #[tokio::test]
    async fn test_activity_log_is_capped_in_memory_but_not_on_disk() {
        let dir = TempDir::new().unwrap();
        let activity = dir.path().join("activity.ndjson");
        let store = StateStore::open(activity.clone(), dir.path().join("state.json")).await;

        store
            .mutate(|_, events| {
                for i in 0..(ACTIVITY_LOG_CAP + 20) {
                    events.push(ActivityEvent::system("tick", i.to_string()));
                }
            })
            .await;
        store.log(ActivityEvent::system("last", "")).await;

        let in_memory = store.read(|s| s.activity_log.len()).await;
        assert_eq!(in_memory, ACTIVITY_LOG_CAP);
        let oldest = store.read(|s| s.activity_log.front().map(|e| e.detail.clone())).await;
        assert_eq!(oldest.as_deref(), Some("21"));

        let lines = std::fs::read_to_string(&activity).unwrap().lines().count();
        assert_eq!(lines, ACTIVITY_LOG_CAP + 21);
        assert_eq!(store.health(), PersistenceHealth::default());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_through_open() {
        let dir = TempDir::new().unwrap();
        let activity = dir.path().join("activity.ndjson");
        let snapshot = dir.path().join("logs/state.json");
        {
            let store = StateStore::open(activity.clone(), snapshot.clone()).await;
            store
                .mutate(|state, events| {
                    state.tasks.push(Task::with_id("t1", "persist me", None));
                    state.agent_roles.insert("A".into(), profile("A", Role::Pm, true));
                    events.push(ActivityEvent::system("task_enqueued", "t1"));
                })
                .await;
        }

        let reopened = StateStore::open(activity, snapshot).await;
        let (tasks, roles, events) = reopened
            .read(|s| (s.tasks.len(), s.agent_roles.len(), s.activity_log.len()))
            .await;
        assert_eq!((tasks, roles, events), (1, 1, 1));
        assert!(reopened.read(|s| s.workers.is_empty()).await);
    }

    #[tokio::test]
    async fn test_persistence_failures_are_counted_not_raised() {
        let dir = TempDir::new().unwrap();
        // A directory where a file is expected makes both writes fail.
        let blocker = dir.path().join("blocker");
        std::fs::create_dir_all(blocker.join("activity.ndjson")).unwrap();
        std::fs::create_dir_all(blocker.join("state.json")).unwrap();
        let store = StateStore::build(
            AppState::default(),
            Some(blocker.join("activity.ndjson")),
            Some(blocker.join("state.json")),
        );

        let result = store
            .mutate(|state, events| {
                state.tasks.push(Task::with_id("t1", "still applied", None));
                events.push(ActivityEvent::system("task_enqueued", "t1"));
                42
            })
            .await;

        assert_eq!(result, 42);
        assert!(store.read(|s| s.task("t1").is_some()).await);
        let health = store.health();
        assert_eq!(health.activity_append_failures, 1);
        assert_eq!(health.snapshot_failures, 1);
    }

    #[tokio::test]
    async fn test_agent_for_role_tie_break() {
        let store = StateStore::in_memory();
        store
            .mutate(|state, _| {
                for p in [
                    profile("TL2", Role::TechLead, false),
                    profile("TL1", Role::TechLead, false),
                    profile("P1", Role::Pm, false),
                    profile("Z9", Role::Pm, true),
                ] {
                    state.agent_roles.insert(p.agent_id.clone(), p);
                }
            })
            .await;

        let (tl, pm, qa) = store
            .read(|s| {
                (
                    s.agent_for_role(Role::TechLead).map(|p| p.agent_id.clone()),
                    s.agent_for_role(Role::Pm).map(|p| p.agent_id.clone()),
                    s.agent_for_role(Role::Qa).map(|p| p.agent_id.clone()),
                )
            })
            .await;
        assert_eq!(tl.as_deref(), Some("TL1"));
        assert_eq!(pm.as_deref(), Some("Z9"), "explicit isPm wins");
        assert!(qa.is_none());
    }

    #[tokio::test]
    async fn test_activity_filter_and_limit() {
        let store = StateStore::in_memory();
        for i in 0..10 {
            let agent = if i % 2 == 0 { "B1" } else { "B2" };
            store
                .log(ActivityEvent::agent("step", i.to_string()).with_agent(agent))
                .await;
        }
        let filter = ActivityFilter {
            agent_id: Some("B1".into()),
            ..ActivityFilter::default()
        };
        let events = store.activity(&filter, 2).await;
        assert_eq!(events.iter().map(|e| e.detail.as_str()).collect::<Vec<_>>(), ["6", "8"]);
    }
}
