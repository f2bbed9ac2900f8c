//! Job executor
//!
//! Drives one job from `Pending` to a terminal state:
//! 1. claim the job (at most one execution per id) and move it to `Running`
//! 2. prepare the workspace and write the run's input files
//! 3. hand the run to the provisioner, forwarding each output line into the
//!    job record as it arrives
//! 4. record artifacts (`Completed`) or the failure (`Failed`)
//!
//! Failures after the claim are recorded in the job itself; there is no
//! caller left to return them to. A run interrupted by shutdown leaves the
//! job `Running`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use labforge_core::domain::job::{JobConfig, JobStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::execution::credentials::CredentialProvider;
use crate::execution::provisioner::{OutputSink, ProvisionOutcome, ProvisionRequest, Provisioner};
use crate::execution::{environment, workspace};
use crate::repository::JobStore;

/// Ids with an execution in flight in this process
type ActiveSet = Arc<Mutex<HashSet<Uuid>>>;

/// Exclusive claim on a job id; released on drop
///
/// Held by a run for its whole duration, and by operations such as removal
/// that must not overlap with one.
#[must_use]
pub struct ActiveGuard {
    active: ActiveSet,
    job_id: Uuid,
}

impl ActiveGuard {
    fn acquire(active: &ActiveSet, job_id: Uuid) -> Result<Self> {
        let mut ids = active.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(job_id) {
            return Err(JobError::AlreadyRunning(job_id));
        }
        Ok(Self {
            active: Arc::clone(active),
            job_id,
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

/// Runs provisioning jobs against a [`JobStore`]
pub struct Executor {
    store: Arc<JobStore>,
    provisioner: Arc<dyn Provisioner>,
    credentials: Arc<dyn CredentialProvider>,
    active: ActiveSet,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    /// Upper bound on flushing buffered output after the provisioner returns
    drain_timeout: Duration,
}

impl Executor {
    pub fn new(
        store: Arc<JobStore>,
        provisioner: Arc<dyn Provisioner>,
        credentials: Arc<dyn CredentialProvider>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            provisioner,
            credentials,
            active: Arc::new(Mutex::new(HashSet::new())),
            tasks: TaskTracker::new(),
            shutdown,
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Whether an execution for this job is in flight
    pub fn is_active(&self, job_id: Uuid) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&job_id)
    }

    /// Reserves the job so no run can start until the guard is dropped
    pub fn try_claim(&self, job_id: Uuid) -> Result<ActiveGuard> {
        ActiveGuard::acquire(&self.active, job_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Runs the job on its own task and returns immediately
    ///
    /// A rejected run (unknown id, already running, not `Pending`) is logged
    /// and reported through the handle.
    pub fn spawn(
        self: &Arc<Self>,
        job_id: Uuid,
        config: JobConfig,
        work_dir: PathBuf,
    ) -> JoinHandle<Result<JobStatus>> {
        let executor = Arc::clone(self);
        self.tasks.spawn(async move {
            let result = executor.run(job_id, config, work_dir).await;
            if let Err(e) = &result {
                error!(job_id = %job_id, error = %e, "Job execution rejected");
            }
            result
        })
    }

    /// Drives the job to a terminal state and returns the final status
    ///
    /// Returns `Running` when the run was interrupted by shutdown.
    pub async fn run(&self, job_id: Uuid, config: JobConfig, work_dir: PathBuf) -> Result<JobStatus> {
        let _claim = ActiveGuard::acquire(&self.active, job_id)?;
        self.store.update_status(job_id, JobStatus::Running)?;

        info!(job_id = %job_id, workspace = %work_dir.display(), "Job started");
        self.persist(job_id).await;

        let outcome = self.drive(job_id, &config, &work_dir).await;

        let status = match outcome {
            ProvisionOutcome::Succeeded(artifacts) => {
                self.store.complete(job_id, artifacts).inspect_err(|e| {
                    warn!(job_id = %job_id, error = %e, "Failed to record completion");
                })?;
                info!(job_id = %job_id, "Job completed");
                JobStatus::Completed
            }
            ProvisionOutcome::Failed(reason) => {
                warn!(job_id = %job_id, reason = %reason, "Job failed");
                self.store.fail(job_id, reason).inspect_err(|e| {
                    warn!(job_id = %job_id, error = %e, "Failed to record failure");
                })?;
                JobStatus::Failed
            }
            ProvisionOutcome::Interrupted => {
                warn!(job_id = %job_id, "Job interrupted by shutdown, leaving it Running");
                JobStatus::Running
            }
        };

        self.persist(job_id).await;
        Ok(status)
    }

    async fn drive(&self, job_id: Uuid, config: &JobConfig, work_dir: &Path) -> ProvisionOutcome {
        if let Err(e) = workspace::prepare(work_dir, config).await {
            return ProvisionOutcome::Failed(e.to_string());
        }

        let credentials = match self.credentials.credentials() {
            Ok(credentials) => credentials,
            Err(e) => return ProvisionOutcome::Failed(e.to_string()),
        };

        let request = ProvisionRequest {
            job_id,
            workspace: work_dir.to_path_buf(),
            config: config.clone(),
            env: environment::build(job_id, work_dir, config, credentials),
        };

        let (sink, lines) = OutputSink::channel();
        let mut forwarder = self.spawn_forwarder(job_id, lines);

        let outcome = self
            .provisioner
            .provision(&request, sink, self.shutdown.child_token())
            .await;

        // Every line must land before the terminal transition freezes output
        if tokio::time::timeout(self.drain_timeout, &mut forwarder)
            .await
            .is_err()
        {
            warn!(job_id = %job_id, "Output still streaming after the run ended, detaching");
            forwarder.abort();
        }

        outcome
    }

    /// Appends lines to the job in arrival order; the store lock is taken
    /// per line and never held across a receive
    fn spawn_forwarder(&self, job_id: Uuid, mut lines: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                if let Err(e) = store.append_output(job_id, line) {
                    warn!(job_id = %job_id, error = %e, "Dropping output for job");
                    break;
                }
            }
        })
    }

    /// Saves the job off the async threads; failures are only logged
    async fn persist(&self, job_id: Uuid) {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.save_job(job_id)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(job_id = %job_id, error = %e, "Failed to persist job"),
            Err(e) => error!(job_id = %job_id, error = %e, "Persist task panicked"),
        }
    }

    /// Signals every run to stop and waits for them to settle
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Waits for every spawned run to finish without cancelling them
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::execution::credentials::StaticCredentials;
    use crate::execution::provisioner::{InProcessProvisioner, ProcessProvisioner};
    use crate::repository::JobPersistence;
    use labforge_core::domain::job::JobArtifacts;

    fn executor_with(store: Arc<JobStore>, provisioner: Arc<dyn Provisioner>) -> Arc<Executor> {
        Arc::new(Executor::new(
            store,
            provisioner,
            Arc::new(StaticCredentials::default()),
            CancellationToken::new(),
        ))
    }

    fn shell(script: &str) -> Arc<dyn Provisioner> {
        Arc::new(
            ProcessProvisioner::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
                .with_grace(Duration::from_secs(2)),
        )
    }

    #[tokio::test]
    async fn test_successful_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::in_memory());
        let id = store.create_job(serde_json::json!({"region": "eu-west-1"}));
        let executor = executor_with(
            Arc::clone(&store),
            shell(r#"echo "creating cluster in $LABFORGE_REGION"; printf '{"kubeconfig":"kc"}' > outputs.json"#),
        );

        let status = executor
            .run(id, store.get_job(id).unwrap().config, dir.path().join("ws"))
            .await
            .unwrap();

        assert_eq!(status, JobStatus::Completed);
        let job = store.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output, vec!["creating cluster in eu-west-1"]);
        assert_eq!(job.artifacts.unwrap().kubeconfig.as_deref(), Some("kc"));
        assert!(job.error.is_none());
        assert!(!executor.is_active(id));
    }

    #[tokio::test]
    async fn test_failed_run_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::in_memory());
        let id = store.create_job(serde_json::Value::Null);
        let executor = executor_with(Arc::clone(&store), shell("echo 'pulumi: error'; exit 2"));

        let status = executor
            .run(id, serde_json::Value::Null, dir.path().to_path_buf())
            .await
            .unwrap();

        assert_eq!(status, JobStatus::Failed);
        let job = store.get_job(id).unwrap();
        assert_eq!(job.output, vec!["pulumi: error"]);
        assert_eq!(
            job.error.as_deref(),
            Some("provisioning program exited with code 2")
        );
        assert!(job.artifacts.is_none());
    }

    #[tokio::test]
    async fn test_large_output_is_complete_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::in_memory());
        let id = store.create_job(serde_json::Value::Null);
        let executor = executor_with(Arc::clone(&store), shell("seq 1 2000"));

        executor
            .run(id, serde_json::Value::Null, dir.path().to_path_buf())
            .await
            .unwrap();

        let expected: Vec<String> = (1..=2000).map(|i| i.to_string()).collect();
        assert_eq!(store.get_job(id).unwrap().output, expected);
    }

    #[tokio::test]
    async fn test_output_is_visible_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::in_memory());
        let id = store.create_job(serde_json::Value::Null);
        let executor = executor_with(Arc::clone(&store), shell("echo first; sleep 2; echo second"));

        let handle = executor.spawn(id, serde_json::Value::Null, dir.path().to_path_buf());

        let mut seen_partial = false;
        for _ in 0..150 {
            let job = store.get_job(id).unwrap();
            if job.status == JobStatus::Running && job.output == vec!["first"] {
                seen_partial = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen_partial, "first line should be visible before the run ends");

        assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Completed);
        assert_eq!(store.get_job(id).unwrap().output, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_second_concurrent_run_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::in_memory());
        let id = store.create_job(serde_json::Value::Null);
        let executor = executor_with(Arc::clone(&store), shell("sleep 1"));

        let first = executor.spawn(id, serde_json::Value::Null, dir.path().join("a"));
        for _ in 0..100 {
            if executor.is_active(id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = executor
            .run(id, serde_json::Value::Null, dir.path().join("b"))
            .await;
        assert!(matches!(second, Err(JobError::AlreadyRunning(rejected)) if rejected == id));

        assert_eq!(first.await.unwrap().unwrap(), JobStatus::Completed);
        assert!(!dir.path().join("b").exists());
    }

    #[tokio::test]
    async fn test_rerun_of_terminal_job_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::in_memory());
        let id = store.create_job(serde_json::Value::Null);
        let executor = executor_with(Arc::clone(&store), shell("true"));

        executor
            .run(id, serde_json::Value::Null, dir.path().to_path_buf())
            .await
            .unwrap();
        let again = executor
            .run(id, serde_json::Value::Null, dir.path().to_path_buf())
            .await;

        assert!(matches!(
            again,
            Err(JobError::InvalidTransition { from: JobStatus::Completed, .. })
        ));
        assert!(!executor.is_active(id));
    }

    #[tokio::test]
    async fn test_unknown_job_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::in_memory());
        let executor = executor_with(Arc::clone(&store), shell("true"));

        let result = executor
            .run(Uuid::new_v4(), serde_json::Value::Null, dir.path().to_path_buf())
            .await;
        assert!(matches!(result, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_credential_failure_fails_job() {
        struct Broken;
        impl CredentialProvider for Broken {
            fn credentials(&self) -> Result<std::collections::HashMap<String, String>> {
                Err(JobError::Credentials("vault sealed".to_string()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::in_memory());
        let id = store.create_job(serde_json::Value::Null);
        let executor = Executor::new(
            Arc::clone(&store),
            shell("echo should-not-run"),
            Arc::new(Broken),
            CancellationToken::new(),
        );

        let status = executor
            .run(id, serde_json::Value::Null, dir.path().to_path_buf())
            .await
            .unwrap();

        assert_eq!(status, JobStatus::Failed);
        let job = store.get_job(id).unwrap();
        assert!(job.output.is_empty());
        assert!(job.error.unwrap().contains("vault sealed"));
    }

    #[tokio::test]
    async fn test_credentials_and_template_reach_program() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::in_memory());
        let config = serde_json::json!({"template": "resources: {}"});
        let id = store.create_job(config.clone());
        let executor = Executor::new(
            Arc::clone(&store),
            shell(r#"echo "$CLOUD_TOKEN"; cat template.yaml; echo"#),
            Arc::new(StaticCredentials::default().with("CLOUD_TOKEN", "t0k3n")),
            CancellationToken::new(),
        );

        executor
            .run(id, config, dir.path().to_path_buf())
            .await
            .unwrap();

        assert_eq!(
            store.get_job(id).unwrap().output,
            vec!["t0k3n", "resources: {}"]
        );
    }

    #[tokio::test]
    async fn test_in_process_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::in_memory());
        let id = store.create_job(serde_json::Value::Null);
        let provisioner = InProcessProvisioner::new(|req, out| {
            assert!(req.workspace.join(workspace::CONFIG_FILE).exists());
            out.line("planning");
            out.line("applying");
            Ok(JobArtifacts {
                kubeconfig: None,
                coder_config: Some(serde_json::json!({"url": "https://coder.lab"})),
            })
        });
        let executor = executor_with(Arc::clone(&store), Arc::new(provisioner));

        executor
            .run(id, serde_json::Value::Null, dir.path().to_path_buf())
            .await
            .unwrap();

        let job = store.get_job(id).unwrap();
        assert_eq!(job.output, vec!["planning", "applying"]);
        assert!(job.artifacts.unwrap().coder_config.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_leaves_job_running_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JobPersistence::new(dir.path().join("jobs"));
        let store = Arc::new(JobStore::with_persistence(persistence.clone()));
        let id = store.create_job(serde_json::Value::Null);
        let executor = executor_with(Arc::clone(&store), shell("echo started; exec sleep 30"));

        let handle = executor.spawn(id, serde_json::Value::Null, dir.path().join("ws"));
        for _ in 0..200 {
            if store.get_job(id).unwrap().output == vec!["started"] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        executor.shutdown().await;

        assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Running);
        let job = store.get_job(id).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.error.is_none());

        let fresh = JobStore::with_persistence(persistence);
        fresh.load_jobs().unwrap();
        let reloaded = fresh.get_job(id).unwrap();
        assert_eq!(reloaded.status, JobStatus::Running);
        assert_eq!(reloaded.output, vec!["started"]);
    }

    #[tokio::test]
    async fn test_concurrent_jobs_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::in_memory());
        let executor = executor_with(
            Arc::clone(&store),
            shell(r#"for i in 1 2 3; do echo "$LABFORGE_JOB_ID-$i"; done"#),
        );

        let ids: Vec<Uuid> = (0..8)
            .map(|_| store.create_job(serde_json::Value::Null))
            .collect();
        let handles: Vec<_> = ids
            .iter()
            .map(|&id| executor.spawn(id, serde_json::Value::Null, dir.path().join(id.to_string())))
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), JobStatus::Completed);
        }

        for id in ids {
            let expected: Vec<String> = (1..=3).map(|i| format!("{id}-{i}")).collect();
            assert_eq!(store.get_job(id).unwrap().output, expected);
        }
        assert_eq!(executor.active_count(), 0);
    }
}
