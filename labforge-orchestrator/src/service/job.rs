//! Job Service
//!
//! The surface collaborators (CLI, request handlers) use to manage jobs.
//! Creation returns immediately; execution continues on its own task and
//! reports everything that happens afterwards through the job record.

use std::sync::Arc;

use labforge_core::domain::job::Job;
use labforge_core::dto::job::CreateJob;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::execution::{Executor, WorkspaceManager};
use crate::recovery;
use crate::repository::JobStore;

/// Job lifecycle facade over the store, executor and workspaces
pub struct JobService {
    store: Arc<JobStore>,
    executor: Arc<Executor>,
    workspaces: WorkspaceManager,
}

impl JobService {
    pub fn new(store: Arc<JobStore>, executor: Arc<Executor>, workspaces: WorkspaceManager) -> Self {
        Self {
            store,
            executor,
            workspaces,
        }
    }

    /// Direct access to the record store for fine-grained mutations
    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Create a job and start provisioning it in the background
    ///
    /// Never blocks on provisioning and never fails: the config is not
    /// validated here.
    pub fn create_job(&self, req: CreateJob) -> Uuid {
        let config = req.config;
        let id = self.store.create_job(config.clone());

        if let Err(e) = self.store.save_job(id) {
            warn!(job_id = %id, error = %e, "Failed to persist new job");
        }

        info!(job_id = %id, "Job created, launching provisioning");
        self.executor.spawn(id, config, self.workspaces.path(id));
        id
    }

    /// Get a job by ID
    pub fn get_job(&self, id: Uuid) -> Result<Job> {
        self.store.get_job(id).ok_or(JobError::NotFound(id))
    }

    /// List all jobs, newest first
    pub fn list_jobs(&self) -> Vec<Job> {
        self.store.list_jobs()
    }

    /// Remove a job, its persisted record and its workspace
    ///
    /// Refused while the job's execution is in flight in this process. A job
    /// left `Running` by a previous process can be removed. The job stays
    /// claimed until removal finishes, so a launch racing with it is rejected.
    pub fn remove_job(&self, id: Uuid) -> Result<bool> {
        let _claim = self.executor.try_claim(id)?;

        let removed = self.store.remove_job(id)?;
        self.workspaces.reclaim(id)?;
        Ok(removed)
    }

    /// Start a new job from an existing job's config
    ///
    /// The old job is left untouched as history.
    pub fn recreate_job(&self, id: Uuid) -> Result<Uuid> {
        let previous = self.get_job(id)?;
        let new_id = self.create_job(CreateJob::new(previous.config));
        info!(job_id = %new_id, previous = %id, "Job recreated");
        Ok(new_id)
    }

    /// Jobs stuck in `Running` with no execution in this process
    pub fn stale_jobs(&self) -> Vec<Job> {
        recovery::stale_jobs(&self.store)
            .into_iter()
            .filter(|job| !self.executor.is_active(job.id))
            .collect()
    }

    /// Wait for every launched job to finish
    pub async fn wait_idle(&self) {
        self.executor.wait_idle().await;
    }

    /// Stop running jobs (leaving them `Running`) and persist every record
    pub async fn shutdown(&self) -> Result<usize> {
        info!(active = self.executor.active_count(), "Shutting down job service");
        self.executor.shutdown().await;

        let saved = self.store.save_all()?;
        info!(saved, "Job records flushed");
        Ok(saved)
    }
}
