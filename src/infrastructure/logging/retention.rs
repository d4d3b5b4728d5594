//! Retention sweep for rolled log files.

use std::path::Path;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use tracing::{debug, warn};

/// Base name of the rolling log file; rolled files carry a date suffix.
pub const LOG_FILE_NAME: &str = "cowai.log";

/// Delete rolled log files in `log_dir` last modified more than
/// `retention_days` ago. Returns how many were removed.
///
/// A retention of zero keeps everything.
pub fn sweep_old_logs(log_dir: &Path, retention_days: u32) -> Result<usize> {
    if retention_days == 0 || !log_dir.exists() {
        return Ok(0);
    }
    let max_age = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
    let cutoff = SystemTime::now()
        .checked_sub(max_age)
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    let entries = std::fs::read_dir(log_dir)
        .with_context(|| format!("failed to read log directory {}", log_dir.display()))?;
    for entry in entries {
        let entry = entry.context("failed to read directory entry")?;
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(LOG_FILE_NAME) {
            continue;
        }
        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                warn!(file = ?name, error = %e, "cannot read log file age");
                continue;
            }
        };
        if modified < cutoff {
            let path = entry.path();
            std::fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            debug!(file = %path.display(), "removed expired log file");
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn age(path: &Path, days: u64) {
        let when = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60);
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(when).unwrap();
    }

    #[test]
    fn test_sweep_removes_only_expired_log_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let old = dir.path().join("cowai.log.2020-01-01");
        let fresh = dir.path().join("cowai.log.2026-10-18");
        let other = dir.path().join("notes.txt");
        for p in [&old, &fresh, &other] {
            std::fs::write(p, "x").unwrap();
        }
        age(&old, 40);
        age(&other, 40);

        assert_eq!(sweep_old_logs(dir.path(), 30).unwrap(), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_zero_retention_keeps_everything() {
        let dir = tempfile::TempDir::new().unwrap();
        let old = dir.path().join("cowai.log");
        std::fs::write(&old, "x").unwrap();
        age(&old, 400);
        assert_eq!(sweep_old_logs(dir.path(), 0).unwrap(), 0);
        assert!(old.exists());
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(sweep_old_logs(&dir.path().join("nope"), 7).unwrap(), 0);
    }
}
