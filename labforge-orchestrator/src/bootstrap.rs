//! Startup wiring
//!
//! Builds a ready [`JobService`] from configuration: directories, persisted
//! records, stale-job report, credentials and the provisioner.

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::execution::{
    CredentialProvider, EnvFileCredentials, Executor, ProcessProvisioner, Provisioner,
    StaticCredentials, WorkspaceManager,
};
use crate::recovery;
use crate::repository::{JobPersistence, JobStore};
use crate::service::JobService;

/// Builds the service with the external-program provisioner from `config`
pub fn bootstrap(config: &OrchestratorConfig, shutdown: CancellationToken) -> anyhow::Result<JobService> {
    let provisioner = ProcessProvisioner::new(&config.program, config.program_args.clone())
        .with_grace(config.shutdown_grace);
    bootstrap_with(config, Arc::new(provisioner), shutdown)
}

/// Builds the service around an arbitrary provisioner
pub fn bootstrap_with(
    config: &OrchestratorConfig,
    provisioner: Arc<dyn Provisioner>,
    shutdown: CancellationToken,
) -> anyhow::Result<JobService> {
    config.validate()?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;
    std::fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("Failed to create work directory {}", config.work_dir.display()))?;

    let store = Arc::new(JobStore::with_persistence(JobPersistence::new(&config.data_dir)));
    store.load_jobs().context("Failed to load job records")?;

    let stale = recovery::report_stale(&store);
    if stale > 0 {
        warn!(count = stale, "Jobs left running by a previous process");
    }

    let workspaces = WorkspaceManager::new(&config.work_dir);
    if let Err(e) = recovery::orphan_workspaces(&store, &workspaces) {
        warn!(error = %e, "Failed to scan workspaces");
    }

    let credentials: Arc<dyn CredentialProvider> = match &config.credentials_file {
        Some(path) => {
            info!(path = %path.display(), "Using credentials file");
            Arc::new(EnvFileCredentials::new(path))
        }
        None => Arc::new(StaticCredentials::default()),
    };

    let executor = Arc::new(Executor::new(
        Arc::clone(&store),
        provisioner,
        credentials,
        shutdown,
    ));

    Ok(JobService::new(store, executor, workspaces))
}

#[cfg(test)]
mod tests {
    use super::*;
    use labforge_core::domain::job::{JobArtifacts, JobStatus};
    use labforge_core::dto::job::CreateJob;

    use crate::execution::InProcessProvisioner;

    fn config_in(dir: &std::path::Path) -> OrchestratorConfig {
        OrchestratorConfig::new(dir.join("jobs"), dir.join("work"))
    }

    #[test]
    fn test_bootstrap_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let service = bootstrap(&config, CancellationToken::new()).unwrap();

        assert!(config.data_dir.is_dir());
        assert!(config.work_dir.is_dir());
        assert!(service.list_jobs().is_empty());
    }

    #[test]
    fn test_bootstrap_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig::new(dir.path(), dir.path());
        assert!(bootstrap(&config, CancellationToken::new()).is_err());
    }

    #[test]
    fn test_bootstrap_reloads_and_keeps_stale_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let previous = JobStore::with_persistence(JobPersistence::new(&config.data_dir));
        let id = previous.create_job(serde_json::json!({"lab": "k8s-basics"}));
        previous.update_status(id, JobStatus::Running).unwrap();
        previous.save_job(id).unwrap();

        let service = bootstrap(&config, CancellationToken::new()).unwrap();

        let job = service.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(service.stale_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_with_in_process_provisioner() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let provisioner = InProcessProvisioner::new(|_, output| {
            output.line("applied");
            Ok(JobArtifacts {
                kubeconfig: Some("apiVersion: v1".to_string()),
                coder_config: None,
            })
        });

        let service =
            bootstrap_with(&config, Arc::new(provisioner), CancellationToken::new()).unwrap();
        let id = service.create_job(CreateJob::default());
        service.wait_idle().await;

        let job = service.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output, vec!["applied"]);
        assert_eq!(
            job.artifacts.and_then(|a| a.kubeconfig).as_deref(),
            Some("apiVersion: v1")
        );
    }
}
