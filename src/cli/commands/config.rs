//! `cowai config`: print the resolved configuration.

use anyhow::{Context, Result};

use crate::domain::models::Config;

pub fn execute(config: &Config, json_mode: bool) -> Result<()> {
    let rendered = if json_mode {
        serde_json::to_string_pretty(config).context("Failed to render config as JSON")?
    } else {
        serde_yaml::to_string(config).context("Failed to render config as YAML")?
    };
    println!("{rendered}");
    Ok(())
}
