//! Port trait definitions
//!
//! The only outward capability the engines need is running shell commands;
//! git, the coding agent and verify commands all go through it.

pub mod command_runner;

pub use command_runner::{CommandRunner, RunOptions};
