//! Subprocess execution port.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::models::CommandResult;

/// Options for one command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Kill the process after this long
    pub timeout: Option<Duration>,
    /// Extra environment on top of the inherited one
    pub env: HashMap<String, String>,
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            env: HashMap::new(),
        }
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Runs shell commands and captures their output.
///
/// Implementations never fail: spawn errors, non-zero exits and timeouts are
/// all reported through [`CommandResult`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, cwd: &Path, opts: RunOptions) -> CommandResult;
}
