use std::path::Path;

use anyhow::{Context, Result};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::domain::models::{ActivityEvent, ActivityFilter};

/// Append events to the ndjson log, one JSON object per line.
pub async fn append_events(path: &Path, events: &[ActivityEvent]) -> Result<()> {
    if events.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut buf = String::new();
    for event in events {
        buf.push_str(&serde_json::to_string(event).context("Failed to serialize activity event")?);
        buf.push('\n');
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to open activity log {}", path.display()))?;
    file.write_all(buf.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Read the durable log, keeping the newest `limit` events that match.
///
/// Lines that fail to parse are skipped.
pub async fn read_events(path: &Path, filter: &ActivityFilter, limit: usize) -> Result<Vec<ActivityEvent>> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    let mut skipped = 0usize;
    let mut events: Vec<ActivityEvent> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<ActivityEvent>(line) {
            Ok(event) => Some(event),
            Err(_) => {
                skipped += 1;
                None
            }
        })
        .filter(|event| filter.matches(event))
        .collect();

    if skipped > 0 {
        warn!(path = %path.display(), skipped, "skipped unparsable activity lines");
    }

    let start = events.len().saturating_sub(limit);
    Ok(events.split_off(start))
}
