//! Domain layer for the cowai orchestrator
//!
//! Core models, the error taxonomy and the ports services depend on.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{ErrorKind, OpError, OpResult, PolicyError};
