//! MCP (Model Context Protocol) stdio adapter.
//!
//! Exposes the orchestrator's operations as MCP tools for coding agents.

pub mod stdio_server;

pub use stdio_server::{tool_definitions, StdioServer, ToolOutput};
