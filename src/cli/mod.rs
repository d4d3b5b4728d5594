//! Command-line interface.

pub mod commands;
pub mod output;
pub mod types;

pub use types::{ActivityArgs, Cli, Commands};

/// Print an error (JSON or human) and exit with status 1.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let body = serde_json::json!({ "ok": false, "error": format!("{err:#}") });
        eprintln!("{body}");
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1)
}
