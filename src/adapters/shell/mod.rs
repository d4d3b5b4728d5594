//! Shell command execution backed by `tokio::process`.

mod runner;

pub use runner::ShellCommandRunner;
