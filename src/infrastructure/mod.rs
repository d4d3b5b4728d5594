//! Infrastructure layer module
//!
//! - Configuration management (figment)
//! - Logging infrastructure (tracing)
//! - File persistence for the activity log and state snapshot

pub mod config;
pub mod logging;
pub mod persistence;
