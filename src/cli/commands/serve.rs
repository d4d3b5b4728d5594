//! `cowai serve`: MCP over stdio plus the enabled loops.

use std::path::Path;

use anyhow::{Context, Result};

use crate::application::Orchestrator;
use crate::domain::models::Config;

pub async fn execute(dir: &Path, config: Config) -> Result<()> {
    let base_dir = std::path::absolute(dir).with_context(|| format!("invalid project dir {}", dir.display()))?;
    let orchestrator = Orchestrator::start(config, base_dir).await?;
    orchestrator.serve_stdio().await
}
