//! CLI type definitions
//!
//! This module contains clap command structures that define the CLI interface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "cowai")]
#[command(about = "cowai - coding-agent task orchestrator", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,

    /// Project directory holding .cowai/ and the state files
    #[arg(short = 'C', long, global = true, default_value = ".")]
    pub dir: PathBuf,
}

impl Cli {
    /// The subcommand to run; `serve` when none is given.
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Serve)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Serve MCP over stdio and run the enabled background loops
    Serve,

    /// Show task counts from the state snapshot
    Status,

    /// Tail the durable activity log
    Activity(ActivityArgs),

    /// Print the resolved configuration
    Config,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ActivityArgs {
    /// Maximum number of events to show
    #[arg(short, long, default_value = "50")]
    pub limit: usize,

    /// Only events for this agent
    #[arg(short, long)]
    pub agent: Option<String>,

    /// Only events for this workflow
    #[arg(short, long)]
    pub workflow: Option<String>,
}
