pub mod activity;
pub mod command;
pub mod config;
pub mod ids;
pub mod policy;
pub mod role;
pub mod run;
pub mod task;
pub mod worker;
pub mod workflow;

pub use activity::{ActivityEvent, ActivityFilter, ActivityType, ACTIVITY_LOG_CAP};
pub use command::{shell_quote, CommandResult};
pub use config::{Config, LoggingConfig};
pub use ids::issue_id;
pub use policy::{RepoPolicy, SecurityPolicy};
pub use role::{AgentRoleProfile, Role, RoleSpec};
pub use run::{RunRecord, RunStatus, TaskRunMeta};
pub use task::{Task, TaskStatus, TaskType};
pub use worker::{Worker, WorkerSpec, WorkersFile, DEFAULT_WORKTREE_DIR};
pub use workflow::{StoryAnswer, StoryQuestion, StoryWorkflow, WorkflowStatus};
