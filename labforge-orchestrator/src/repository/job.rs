//! Job Repository
//!
//! The in-memory record store: the single source of truth for job state
//! while the process is alive. One reader/writer lock guards the whole map
//! and is only ever held for a map read or write, never across file or
//! process I/O. Reads hand out clones.
//!
//! Durability is layered on top through an optional [`JobPersistence`]:
//! saves snapshot the record under the read lock and write it after the lock
//! is released.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use labforge_core::domain::job::{Job, JobArtifacts, JobConfig, JobStatus};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::repository::persistence::JobPersistence;

/// Outcome of loading persisted records into a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
}

#[derive(Default)]
struct Records {
    jobs: HashMap<Uuid, Job>,
    /// Ids removed during this process's lifetime; never handed out again
    retired: HashSet<Uuid>,
}

/// Concurrent store of job records
pub struct JobStore {
    records: RwLock<Records>,
    persistence: Option<JobPersistence>,
    /// Serializes snapshot-and-write so an older snapshot never lands last
    save_lock: Mutex<()>,
}

impl JobStore {
    /// Creates a store without durable backing
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(Records::default()),
            persistence: None,
            save_lock: Mutex::new(()),
        }
    }

    /// Creates a store whose records can be saved to and loaded from disk
    pub fn with_persistence(persistence: JobPersistence) -> Self {
        Self {
            persistence: Some(persistence),
            ..Self::in_memory()
        }
    }

    pub fn persistence(&self) -> Option<&JobPersistence> {
        self.persistence.as_ref()
    }

    // Every critical section is a single map operation, so a panic while
    // holding the lock cannot leave a half-applied mutation behind.
    fn read(&self) -> RwLockReadGuard<'_, Records> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates a new `Pending` job and returns its id
    ///
    /// Never fails: the config is stored as given, `null` included.
    pub fn create_job(&self, config: JobConfig) -> Uuid {
        let mut records = self.write();

        let id = loop {
            let candidate = Uuid::new_v4();
            if !records.jobs.contains_key(&candidate) && !records.retired.contains(&candidate) {
                break candidate;
            }
        };

        records.jobs.insert(id, Job::new(id, config, Utc::now()));
        drop(records);

        debug!(job_id = %id, "Job created");
        id
    }

    /// Returns a copy of the job, or `None` if the id is unknown
    pub fn get_job(&self, id: Uuid) -> Option<Job> {
        self.read().jobs.get(&id).cloned()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.read().jobs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns copies of all jobs, newest first, ties broken by id
    pub fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.read().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Moves a job to `status` if the lifecycle allows it
    ///
    /// A job only becomes `Completed` once its artifacts are set and only
    /// becomes `Failed` once its error is set; see [`Self::complete`] and
    /// [`Self::fail`] for doing both at once.
    pub fn update_status(&self, id: Uuid, status: JobStatus) -> Result<()> {
        self.mutate(id, |job| {
            if !job.status.can_transition_to(status) {
                return Err(JobError::invalid_transition(
                    id,
                    job.status,
                    format!("move to {status}"),
                ));
            }
            match status {
                JobStatus::Completed if job.artifacts.is_none() => {
                    return Err(JobError::invalid_transition(
                        id,
                        job.status,
                        "move to Completed without artifacts",
                    ));
                }
                JobStatus::Failed if job.error.is_none() => {
                    return Err(JobError::invalid_transition(
                        id,
                        job.status,
                        "move to Failed without an error",
                    ));
                }
                _ => {}
            }
            job.status = status;
            Ok(())
        })
    }

    /// Appends one output line to a live job
    pub fn append_output(&self, id: Uuid, line: impl Into<String>) -> Result<()> {
        let line = line.into();
        self.mutate(id, |job| {
            ensure_live(job, "append output")?;
            job.output.push(line);
            Ok(())
        })
    }

    /// Records a failure description on a live job
    pub fn set_error(&self, id: Uuid, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.mutate(id, |job| {
            ensure_live(job, "record an error")?;
            if job.artifacts.is_some() {
                return Err(JobError::invalid_transition(
                    id,
                    job.status,
                    "record an error after artifacts were set",
                ));
            }
            job.error = Some(error);
            Ok(())
        })
    }

    /// Records success artifacts on a live job
    pub fn set_artifacts(&self, id: Uuid, artifacts: JobArtifacts) -> Result<()> {
        self.mutate(id, |job| {
            ensure_live(job, "record artifacts")?;
            if job.error.is_some() {
                return Err(JobError::invalid_transition(
                    id,
                    job.status,
                    "record artifacts after an error was set",
                ));
            }
            job.artifacts = Some(artifacts);
            Ok(())
        })
    }

    /// Stores artifacts and moves the job to `Completed` under one lock
    pub fn complete(&self, id: Uuid, artifacts: JobArtifacts) -> Result<()> {
        self.mutate(id, |job| {
            if !job.status.can_transition_to(JobStatus::Completed) {
                return Err(JobError::invalid_transition(id, job.status, "complete"));
            }
            job.status = JobStatus::Completed;
            job.error = None;
            job.artifacts = Some(artifacts);
            Ok(())
        })
    }

    /// Stores the failure and moves the job to `Failed` under one lock
    pub fn fail(&self, id: Uuid, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.mutate(id, |job| {
            if !job.status.can_transition_to(JobStatus::Failed) {
                return Err(JobError::invalid_transition(id, job.status, "fail"));
            }
            job.status = JobStatus::Failed;
            job.artifacts = None;
            job.error = Some(error);
            Ok(())
        })
    }

    /// Applies a mutation and bumps `updated_at` if it succeeds
    fn mutate<F>(&self, id: Uuid, f: F) -> Result<()>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let mut records = self.write();
        let job = records.jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        f(job)?;
        job.updated_at = Utc::now().max(job.updated_at);
        Ok(())
    }

    /// Inserts a record loaded from elsewhere, replacing any same-id record
    pub fn insert(&self, job: Job) {
        self.write().jobs.insert(job.id, job);
    }

    /// Deletes the job from memory and disk
    ///
    /// Idempotent: returns `Ok(false)` if the job was not in memory. The id
    /// is retired either way.
    pub fn remove_job(&self, id: Uuid) -> Result<bool> {
        let existed = {
            let mut records = self.write();
            records.retired.insert(id);
            records.jobs.remove(&id).is_some()
        };

        if let Some(persistence) = &self.persistence {
            let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
            persistence.delete(id)?;
        }

        if existed {
            info!(job_id = %id, "Job removed");
        }
        Ok(existed)
    }

    /// Writes the current record of a job to disk
    ///
    /// A failure is reported but leaves the in-memory record untouched.
    pub fn save_job(&self, id: Uuid) -> Result<()> {
        let Some(persistence) = &self.persistence else {
            return if self.contains(id) {
                Ok(())
            } else {
                Err(JobError::NotFound(id))
            };
        };

        let _guard = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let job = self.get_job(id).ok_or(JobError::NotFound(id))?;
        persistence.write(&job)
    }

    /// Saves every job, continuing past failures; returns the first error
    pub fn save_all(&self) -> Result<usize> {
        let ids: Vec<Uuid> = self.read().jobs.keys().copied().collect();
        let mut saved = 0;
        let mut first_error = None;

        for id in ids {
            match self.save_job(id) {
                Ok(()) => saved += 1,
                // Removed concurrently
                Err(JobError::NotFound(_)) => {}
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Failed to save job");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }

    /// Loads every persisted record into the store
    ///
    /// Records already in memory, or removed during this process's life,
    /// are left alone and counted as skipped.
    pub fn load_jobs(&self) -> Result<LoadReport> {
        let Some(persistence) = &self.persistence else {
            return Ok(LoadReport::default());
        };

        let loaded = persistence.load_all()?;
        let mut report = LoadReport {
            loaded: 0,
            skipped: loaded.skipped,
        };

        {
            let mut records = self.write();
            for job in loaded.jobs {
                if records.jobs.contains_key(&job.id) || records.retired.contains(&job.id) {
                    debug!(job_id = %job.id, "Keeping in-memory state over persisted record");
                    report.skipped += 1;
                    continue;
                }
                records.jobs.insert(job.id, job);
                report.loaded += 1;
            }
        }

        info!(
            loaded = report.loaded,
            skipped = report.skipped,
            dir = %persistence.data_dir().display(),
            "Loaded persisted jobs"
        );
        Ok(report)
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn ensure_live(job: &Job, action: &str) -> Result<()> {
    if job.status.is_terminal() {
        return Err(JobError::invalid_transition(job.id, job.status, action));
    }
    Ok(())
}
