//! Orchestrator configuration
//!
//! Defines where job records and workspaces live, which provisioning
//! program is run, and how long a run gets to exit on shutdown.

use std::path::PathBuf;
use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory holding one JSON file per job
    pub data_dir: PathBuf,

    /// Root under which per-job workspaces are allocated
    pub work_dir: PathBuf,

    /// Provisioning program to execute (e.g., "pulumi")
    pub program: String,

    /// Arguments passed to the provisioning program
    pub program_args: Vec<String>,

    /// Time a running program gets to exit after SIGTERM before it is killed
    pub shutdown_grace: Duration,

    /// Optional `KEY=VALUE` file with provisioning secrets
    pub credentials_file: Option<PathBuf>,
}

impl OrchestratorConfig {
    /// Creates a new configuration with defaults
    pub fn new(data_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            work_dir: work_dir.into(),
            program: "pulumi".to_string(),
            program_args: vec![
                "up".to_string(),
                "--yes".to_string(),
                "--non-interactive".to_string(),
            ],
            shutdown_grace: Duration::from_secs(30),
            credentials_file: None,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - LABFORGE_DATA_DIR (optional, default: ./data/jobs)
    /// - LABFORGE_WORK_DIR (optional, default: ./data/work)
    /// - LABFORGE_PROGRAM (optional, default: pulumi)
    /// - LABFORGE_PROGRAM_ARGS (optional, whitespace separated)
    /// - LABFORGE_SHUTDOWN_GRACE (optional, seconds, default: 30)
    /// - LABFORGE_CREDENTIALS_FILE (optional)
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = std::env::var("LABFORGE_DATA_DIR").unwrap_or_else(|_| "data/jobs".into());
        let work_dir = std::env::var("LABFORGE_WORK_DIR").unwrap_or_else(|_| "data/work".into());

        let mut config = Self::new(data_dir, work_dir);

        if let Ok(program) = std::env::var("LABFORGE_PROGRAM") {
            config.program = program;
        }

        if let Ok(args) = std::env::var("LABFORGE_PROGRAM_ARGS") {
            config.program_args = args.split_whitespace().map(str::to_string).collect();
        }

        if let Ok(grace) = std::env::var("LABFORGE_SHUTDOWN_GRACE") {
            let secs = grace.parse::<u64>().map_err(|_| {
                anyhow::anyhow!("LABFORGE_SHUTDOWN_GRACE must be a number of seconds, got '{grace}'")
            })?;
            config.shutdown_grace = Duration::from_secs(secs);
        }

        config.credentials_file = std::env::var("LABFORGE_CREDENTIALS_FILE")
            .ok()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("data_dir cannot be empty");
        }

        if self.work_dir.as_os_str().is_empty() {
            anyhow::bail!("work_dir cannot be empty");
        }

        if self.data_dir == self.work_dir {
            anyhow::bail!("data_dir and work_dir must be different directories");
        }

        if self.program.trim().is_empty() {
            anyhow::bail!("program cannot be empty");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::new("/var/lib/labforge/jobs", "/var/lib/labforge/work");
        assert_eq!(config.program, "pulumi");
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
        assert!(config.credentials_file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = OrchestratorConfig::new("jobs", "work");
        assert!(config.validate().is_ok());

        config.program = "  ".to_string();
        assert!(config.validate().is_err());

        config.program = "pulumi".to_string();
        config.work_dir = PathBuf::from("jobs");
        assert!(config.validate().is_err());

        config.work_dir = PathBuf::new();
        assert!(config.validate().is_err());
    }
}
