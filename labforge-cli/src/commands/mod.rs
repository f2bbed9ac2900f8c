//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod job;

use job::JobCommands;

use anyhow::Result;
use clap::Subcommand;
use labforge_orchestrator::OrchestratorConfig;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Job management
    Job {
        #[command(subcommand)]
        command: JobCommands,
    },
}

/// Routes the command to the appropriate handler module
pub async fn handle_command(command: Commands, config: &OrchestratorConfig) -> Result<()> {
    match command {
        Commands::Job { command } => job::handle_job_command(command, config).await,
    }
}
