//! `cowai activity`: tail the durable activity log.

use std::path::Path;

use anyhow::Result;
use comfy_table::Cell;
use serde::Serialize;

use crate::cli::output::{list_table, output, truncate, CommandOutput};
use crate::cli::types::ActivityArgs;
use crate::domain::models::{ActivityEvent, ActivityFilter, Config};
use crate::infrastructure::persistence::read_events;

#[derive(Debug, Serialize)]
pub struct ActivityOutput {
    pub events: Vec<ActivityEvent>,
}

impl CommandOutput for ActivityOutput {
    fn to_human(&self) -> String {
        if self.events.is_empty() {
            return "No activity found.".to_string();
        }
        let mut table = list_table(&["time", "type", "action", "agent", "detail"]);
        for e in &self.events {
            table.add_row(vec![
                Cell::new(e.timestamp.format("%Y-%m-%d %H:%M:%S")),
                Cell::new(e.kind.as_str()),
                Cell::new(&e.action),
                Cell::new(e.agent_id.as_deref().unwrap_or("-")),
                Cell::new(truncate(&e.detail, 60)),
            ]);
        }
        table.to_string()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "events": self.events })
    }
}

pub async fn execute(dir: &Path, config: &Config, args: &ActivityArgs, json_mode: bool) -> Result<()> {
    let filter = ActivityFilter {
        workflow_id: args.workflow.clone(),
        agent_id: args.agent.clone(),
        run_id: None,
    };
    let events = read_events(&dir.join(&config.activity_log_file), &filter, args.limit).await?;
    output(&ActivityOutput { events }, json_mode);
    Ok(())
}
