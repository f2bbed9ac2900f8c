//! Labforge CLI
//!
//! Command-line interface for creating and inspecting lab provisioning jobs.

mod commands;
mod id_resolver;
mod types;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use labforge_orchestrator::OrchestratorConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "labforge")]
#[command(about = "Lab environment provisioning jobs", long_about = None)]
struct Cli {
    /// Directory holding job records
    #[arg(long, global = true, env = "LABFORGE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Root of per-job workspaces
    #[arg(long, global = true, env = "LABFORGE_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Provisioning program
    #[arg(long, global = true, env = "LABFORGE_PROGRAM")]
    program: Option<String>,

    /// Whitespace separated program arguments
    #[arg(long, global = true, allow_hyphen_values = true, env = "LABFORGE_PROGRAM_ARGS")]
    program_args: Option<String>,

    /// Seconds a program gets to exit on shutdown
    #[arg(long, global = true, env = "LABFORGE_SHUTDOWN_GRACE")]
    shutdown_grace: Option<u64>,

    /// KEY=VALUE credentials file
    #[arg(long, global = true, env = "LABFORGE_CREDENTIALS_FILE")]
    credentials_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    /// Defaults with flag (or `LABFORGE_*` environment) values applied
    fn config(&self) -> Result<OrchestratorConfig> {
        let mut config = OrchestratorConfig::from_env()?;

        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(dir) = &self.work_dir {
            config.work_dir = dir.clone();
        }
        if let Some(program) = &self.program {
            config.program = program.clone();
        }
        if let Some(args) = &self.program_args {
            config.program_args = args.split_whitespace().map(str::to_string).collect();
        }
        if let Some(secs) = self.shutdown_grace {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(path) = self
            .credentials_file
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
        {
            config.credentials_file = Some(path.clone());
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so job output on stdout stays clean
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "labforge=info,labforge_orchestrator=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = cli.config()?;
    tracing::debug!(
        data_dir = %config.data_dir.display(),
        work_dir = %config.work_dir.display(),
        program = %config.program,
        "Configuration loaded"
    );

    handle_command(cli.command, &config).await
}
