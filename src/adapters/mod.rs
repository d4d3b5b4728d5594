//! Infrastructure adapters for external systems.

pub mod mcp;
pub mod shell;
