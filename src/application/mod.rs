//! Application layer: wires services together and supervises the loops.

pub mod orchestrator;

pub use orchestrator::{worker_env, Orchestrator, Services};
