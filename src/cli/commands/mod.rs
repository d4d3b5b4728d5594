//! Subcommand handlers.

pub mod activity;
pub mod config;
pub mod serve;
pub mod status;
