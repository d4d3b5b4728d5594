//! Captured subprocess results.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quote a value for `sh -c` inside double quotes.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Outcome of a shell command. Failures are data, not errors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// Exit code zero and not timed out
    pub ok: bool,
    pub command: String,
    pub cwd: PathBuf,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
}

impl CommandResult {
    /// A result for a command that never produced a process.
    pub fn spawn_failure(command: impl Into<String>, cwd: impl Into<PathBuf>, error: impl std::fmt::Display) -> Self {
        let now = Utc::now();
        Self {
            ok: false,
            command: command.into(),
            cwd: cwd.into(),
            exit_code: None,
            signal: None,
            stdout: String::new(),
            stderr: error.to_string(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            timed_out: false,
        }
    }

    /// Trimmed stdout, the common case for git plumbing.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Best single-line description of why the command failed.
    pub fn failure_reason(&self) -> String {
        if self.timed_out {
            return format!("timed out after {}ms", self.duration_ms);
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match (self.exit_code, &self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("terminated by {signal}"),
            (None, None) => "unknown failure".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_escapes_specials() {
        assert_eq!(shell_quote("plain"), "\"plain\"");
        assert_eq!(shell_quote("a \"b\" $HOME `x`"), "\"a \\\"b\\\" \\$HOME \\`x\\`\"");
    }

    #[test]
    fn test_failure_reason_prefers_stderr() {
        let mut result = CommandResult::spawn_failure("x", "/tmp", "boom");
        assert_eq!(result.failure_reason(), "boom");
        result.stderr.clear();
        result.exit_code = Some(2);
        assert_eq!(result.failure_reason(), "exit code 2");
        result.timed_out = true;
        assert!(result.failure_reason().starts_with("timed out"));
    }
}
