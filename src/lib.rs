//! cowai - coding-agent task orchestrator
//!
//! Coordinates AI coding-agent workers that operate on isolated git
//! worktrees. Tasks move through a reviewed lifecycle (todo, doing, tech
//! lead review, PM acceptance, merge) with policy-gated command execution,
//! and every operation is exposed as an MCP tool over stdio.
//!
//! # Architecture
//!
//! - **Domain Layer** (`domain`): models, the error taxonomy and ports
//! - **Service Layer** (`services`): lifecycle, acceptance, worktrees, runs, loops
//! - **Adapters** (`adapters`): MCP stdio server and the shell command runner
//! - **Infrastructure Layer** (`infrastructure`): configuration, logging, persistence
//! - **Application Layer** (`application`): service wiring and loop supervision
//! - **CLI Layer** (`cli`): command-line interface

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use application::{Orchestrator, Services};
pub use domain::models::{Config, LoggingConfig, Task, TaskStatus};
pub use domain::{ErrorKind, OpError, OpResult};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{StateStore, TaskLifecycle};
