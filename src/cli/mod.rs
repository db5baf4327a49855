//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, PlanCommand, RunCommand, ValidateCommand};
use std::ffi::OsString;

/// Declarative CI/CD pipeline runner
#[derive(Debug, Parser, Clone)]
#[command(name = "railyard")]
#[command(version)]
#[command(about = "Runs stage-ordered CI/CD pipelines from a YAML definition", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a pipeline for a trigger
    Run(RunCommand),

    /// Show which jobs a trigger would run, without running them
    Plan(PlanCommand),

    /// Validate a pipeline configuration
    Validate(ValidateCommand),

    /// Show execution history
    History(HistoryCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
