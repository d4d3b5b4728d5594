//! `cowai status`: task counts from the state snapshot.

use std::path::Path;

use anyhow::Result;
use comfy_table::Cell;
use serde::Serialize;

use crate::cli::output::{list_table, output, CommandOutput};
use crate::domain::models::{Config, TaskStatus};
use crate::infrastructure::persistence::{load_snapshot, StateSnapshot};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusOutput {
    pub snapshot_found: bool,
    pub counts: Vec<(String, usize)>,
    pub tasks: usize,
    pub workflows: usize,
    pub runs: usize,
}

impl StatusOutput {
    pub fn from_snapshot(snapshot: Option<&StateSnapshot>) -> Self {
        let counts = TaskStatus::ALL
            .iter()
            .map(|st| {
                let n = snapshot.map_or(0, |s| s.tasks.iter().filter(|t| t.status == *st).count());
                (st.as_str().to_string(), n)
            })
            .collect();
        Self {
            snapshot_found: snapshot.is_some(),
            counts,
            tasks: snapshot.map_or(0, |s| s.tasks.len()),
            workflows: snapshot.map_or(0, |s| s.workflows.len()),
            runs: snapshot.map_or(0, |s| s.runs.len()),
        }
    }
}

impl CommandOutput for StatusOutput {
    fn to_human(&self) -> String {
        if !self.snapshot_found {
            return "No state snapshot found.".to_string();
        }
        let mut table = list_table(&["status", "count"]);
        for (status, n) in &self.counts {
            table.add_row(vec![Cell::new(status), Cell::new(n)]);
        }
        format!(
            "{} tasks, {} workflows, {} runs\n{table}",
            self.tasks, self.workflows, self.runs
        )
    }

    fn to_json(&self) -> serde_json::Value {
        let counts: serde_json::Map<String, serde_json::Value> = self
            .counts
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::json!(v)))
            .collect();
        serde_json::json!({
            "snapshotFound": self.snapshot_found,
            "counts": counts,
            "tasks": self.tasks,
            "workflows": self.workflows,
            "runs": self.runs,
        })
    }
}

pub async fn execute(dir: &Path, config: &Config, json_mode: bool) -> Result<()> {
    let snapshot = load_snapshot(&dir.join(&config.state_file)).await;
    output(&StatusOutput::from_snapshot(snapshot.as_ref()), json_mode);
    Ok(())
}
