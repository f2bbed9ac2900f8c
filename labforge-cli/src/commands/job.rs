//! Job command handlers
//!
//! Handles creating jobs (and following them to completion), listing,
//! viewing details and output, removal and recreation.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Subcommand;
use colored::*;
use labforge_core::domain::job::{Job, JobConfig, JobStatus};
use labforge_core::dto::job::{CreateJob, JobSummary};
use labforge_orchestrator::shutdown::install_shutdown_handler;
use labforge_orchestrator::{JobService, OrchestratorConfig, bootstrap};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::id_resolver::resolve_job_id;
use crate::types::IdOrPrefix;

/// How often a followed job is re-read for new output
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Job subcommands
#[derive(Subcommand)]
pub enum JobCommands {
    /// Create a job and follow it until it finishes
    Create {
        /// JSON config file, or `-` for stdin
        #[arg(short, long)]
        config: String,

        /// Template file stored in the config's `template` field
        #[arg(short, long)]
        template: Option<PathBuf>,
    },
    /// List all jobs
    List,
    /// Get job details
    Get {
        /// Job ID or unambiguous prefix
        id: String,

        /// Print the raw record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print a job's captured output
    Logs {
        /// Job ID or unambiguous prefix
        id: String,
    },
    /// Remove a job, its record and its workspace
    Remove {
        /// Job ID or unambiguous prefix
        id: String,
    },
    /// Start a new job with the config of an existing one
    Recreate {
        /// Job ID or unambiguous prefix
        id: String,
    },
    /// List jobs left running by a previous process
    Stale,
}

/// Handle job commands
///
/// Every command loads the persisted records first; only `create` and
/// `recreate` start provisioning.
pub async fn handle_job_command(command: JobCommands, config: &OrchestratorConfig) -> Result<()> {
    let shutdown = install_shutdown_handler();
    let service = bootstrap::bootstrap(config, shutdown.clone())?;

    match command {
        JobCommands::Create { config, template } => {
            let config = load_config(&config, template.as_deref())?;
            let id = service.create_job(CreateJob::new(config));
            println!("{} Job {} created", "✓".green(), id.to_string().cyan());
            follow_job(&service, id, &shutdown).await
        }
        JobCommands::List => list_jobs(&service),
        JobCommands::Get { id, json } => get_job(&service, &id, json),
        JobCommands::Logs { id } => get_job_logs(&service, &id),
        JobCommands::Remove { id } => remove_job(&service, &id),
        JobCommands::Recreate { id } => {
            let previous = resolve_job_id(&service, &IdOrPrefix::parse(&id))?;
            let id = service.recreate_job(previous)?;
            println!(
                "{} Job {} recreated from {}",
                "✓".green(),
                id.to_string().cyan(),
                previous.to_string().dimmed()
            );
            follow_job(&service, id, &shutdown).await
        }
        JobCommands::Stale => list_stale_jobs(&service),
    }
}

/// Reads the job config and folds in the template, if any
fn load_config(source: &str, template: Option<&Path>) -> Result<JobConfig> {
    let raw = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read config from stdin")?;
        buf
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("Failed to read config file {}", source))?
    };

    let mut config: JobConfig =
        serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in {}", source))?;

    if let Some(path) = template {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read template {}", path.display()))?;
        attach_template(&mut config, text)?;
    }

    Ok(config)
}

fn attach_template(config: &mut JobConfig, template: String) -> Result<()> {
    if config.is_null() {
        *config = serde_json::json!({});
    }
    match config.as_object_mut() {
        Some(fields) => {
            fields.insert("template".to_string(), serde_json::Value::String(template));
            Ok(())
        }
        None => bail!("A template can only be attached to a JSON object config"),
    }
}

/// Streams a job's output until it reaches a terminal state
///
/// On Ctrl-C the run is stopped and the job stays `Running`.
async fn follow_job(service: &JobService, id: Uuid, shutdown: &CancellationToken) -> Result<()> {
    let mut printed = 0;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                println!("{}", "Interrupted, stopping provisioning...".yellow());
                service.shutdown().await?;
                print_new_output(&service.get_job(id)?, &mut printed);
                bail!("Job {} interrupted and left Running", id);
            }
            _ = ticker.tick() => {}
        }

        let job = service.get_job(id)?;
        print_new_output(&job, &mut printed);

        if job.is_terminal() {
            // Let the final save land before the process exits
            service.wait_idle().await;
            println!("{}", "─".repeat(80).dimmed());
            print_outcome(&job);
            if job.status == JobStatus::Failed {
                bail!("Job {} failed", id);
            }
            return Ok(());
        }
    }
}

fn print_new_output(job: &Job, printed: &mut usize) {
    for line in job.output.iter().skip(*printed) {
        println!("{}", line);
    }
    *printed = job.output.len();
}

fn print_outcome(job: &Job) {
    println!("Status: {}", colorize_status(&job.status));
    if let Some(error) = &job.error {
        println!("{}", error.red());
    }
    if let Some(artifacts) = &job.artifacts {
        if let Some(kubeconfig) = &artifacts.kubeconfig {
            println!("Kubeconfig: {} bytes", kubeconfig.len());
        }
        if artifacts.coder_config.is_some() {
            println!("Coder config: {}", "available".green());
        }
    }
}

/// List all jobs
fn list_jobs(service: &JobService) -> Result<()> {
    let jobs = service.list_jobs();

    if jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
    } else {
        println!("{}", format!("Found {} job(s):", jobs.len()).bold());
        println!();
        for job in &jobs {
            print_job_summary(&JobSummary::from(job));
        }
    }

    Ok(())
}

/// Get and display a single job
fn get_job(service: &JobService, id: &str, json: bool) -> Result<()> {
    let uuid = resolve_job_id(service, &IdOrPrefix::parse(id))?;
    let job = service.get_job(uuid)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job_details(&job);
    }

    Ok(())
}

/// Print a job's captured output
fn get_job_logs(service: &JobService, id: &str) -> Result<()> {
    let uuid = resolve_job_id(service, &IdOrPrefix::parse(id))?;
    let job = service.get_job(uuid)?;

    if job.output.is_empty() {
        println!("{}", "No output captured for this job.".yellow());
    } else {
        println!("{}", format!("Output of job {}:", uuid).bold());
        println!("{}", "─".repeat(80).dimmed());
        for (n, line) in job.output.iter().enumerate() {
            println!("{} {}", format!("{:>5}", n + 1).dimmed(), line);
        }
        println!("{}", "─".repeat(80).dimmed());
    }

    Ok(())
}

fn remove_job(service: &JobService, id: &str) -> Result<()> {
    let uuid = resolve_job_id(service, &IdOrPrefix::parse(id))?;

    if service.remove_job(uuid)? {
        println!("{} Job {} removed", "✓".green(), uuid.to_string().cyan());
    } else {
        println!("{}", format!("Job {} not found.", uuid).yellow());
    }

    Ok(())
}

fn list_stale_jobs(service: &JobService) -> Result<()> {
    let jobs = service.stale_jobs();

    if jobs.is_empty() {
        println!("{}", "No stale jobs.".green());
        return Ok(());
    }

    println!(
        "{}",
        format!("{} job(s) were running when the orchestrator stopped:", jobs.len()).bold()
    );
    println!();
    for job in &jobs {
        print_job_summary(&JobSummary::from(job));
    }
    println!(
        "{}",
        "Their outcome is unknown. Inspect, then `job remove` or `job recreate` them.".dimmed()
    );

    Ok(())
}

fn print_job_summary(job: &JobSummary) {
    println!("  {} Job {}", "▸".cyan(), job.id.to_string().dimmed());
    println!("    Status:   {}", colorize_status(&job.status));
    println!(
        "    Created:  {}",
        job.created_at
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
            .dimmed()
    );
    println!("    Output:   {} line(s)", job.output_lines);
    if let Some(error) = &job.error {
        println!("    Error:    {}", error.red());
    }
    println!();
}

/// Print detailed job information
fn print_job_details(job: &Job) {
    println!("{}", "Job Details:".bold());
    println!("  ID:          {}", job.id.to_string().cyan());
    println!("  Status:      {}", colorize_status(&job.status));
    println!("  Created:     {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated:     {}", job.updated_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Output:      {} line(s)", job.output.len());

    if !job.config.is_null() {
        println!("\n{}", "Config:".bold());
        match serde_json::to_string_pretty(&job.config) {
            Ok(pretty) => println!("{}", pretty),
            Err(_) => println!("{:?}", job.config),
        }
    }

    if let Some(artifacts) = &job.artifacts {
        println!("\n{}", "Artifacts:".bold());
        if let Some(kubeconfig) = &artifacts.kubeconfig {
            println!("  {} ({} bytes)", "kubeconfig".cyan(), kubeconfig.len());
        }
        if let Some(coder) = &artifacts.coder_config {
            println!("  {} = {}", "coderConfig".cyan(), coder);
        }
    }

    if let Some(error) = &job.error {
        println!("\n{}", "Error:".bold());
        println!("{}", error.red());
    }
}

/// Colorize job status for display
fn colorize_status(status: &JobStatus) -> ColoredString {
    let status_str = status.to_string();
    match status {
        JobStatus::Pending => status_str.yellow(),
        JobStatus::Running => status_str.cyan(),
        JobStatus::Completed => status_str.green(),
        JobStatus::Failed => status_str.red(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_with_template() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("lab.json");
        let template_path = dir.path().join("Pulumi.yaml");
        std::fs::write(&config_path, r#"{"region": "eu-west-1"}"#).unwrap();
        std::fs::write(&template_path, "name: lab\nruntime: yaml\n").unwrap();

        let config = load_config(config_path.to_str().unwrap(), Some(&template_path)).unwrap();

        assert_eq!(config["region"], "eu-west-1");
        assert_eq!(config["template"], "name: lab\nruntime: yaml\n");
    }

    #[test]
    fn test_load_config_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("lab.json");
        std::fs::write(&config_path, "{region").unwrap();

        assert!(load_config(config_path.to_str().unwrap(), None).is_err());
        assert!(load_config("/nonexistent/lab.json", None).is_err());
    }

    #[test]
    fn test_attach_template() {
        let mut config = serde_json::Value::Null;
        attach_template(&mut config, "t".to_string()).unwrap();
        assert_eq!(config, serde_json::json!({"template": "t"}));

        let mut config = serde_json::json!([1, 2]);
        assert!(attach_template(&mut config, "t".to_string()).is_err());
    }
}
