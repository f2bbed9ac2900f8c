//! Startup reconciliation
//!
//! A job persisted as `Running` was in flight when the previous process
//! died. Its real outcome is unknown, so it is neither resumed nor failed:
//! it stays `Running` with a frozen `updated_at` until an operator looks at
//! it (and removes or recreates it). This module only finds and reports such
//! jobs, along with workspace directories no job owns anymore.

use std::collections::HashSet;
use std::path::PathBuf;

use labforge_core::domain::job::{Job, JobStatus};
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::execution::WorkspaceManager;
use crate::repository::JobStore;

/// Jobs left `Running` that no execution in this process owns
///
/// Only meaningful right after loading, before any job has been started.
pub fn stale_jobs(store: &JobStore) -> Vec<Job> {
    let mut stale: Vec<Job> = store
        .list_jobs()
        .into_iter()
        .filter(|job| job.status == JobStatus::Running)
        .collect();
    stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
    stale
}

/// Logs every stale job and returns how many there are
pub fn report_stale(store: &JobStore) -> usize {
    let stale = stale_jobs(store);
    for job in &stale {
        warn!(
            job_id = %job.id,
            last_update = %job.updated_at,
            output_lines = job.output.len(),
            "Job was running when the previous process stopped; outcome unknown, needs attention"
        );
    }
    stale.len()
}

/// Workspace directories with no matching job record
pub fn orphan_workspaces(store: &JobStore, workspaces: &WorkspaceManager) -> Result<Vec<PathBuf>> {
    let known: HashSet<Uuid> = store.list_jobs().iter().map(|job| job.id).collect();
    let orphans = workspaces.orphans(&known)?;
    for path in &orphans {
        warn!(path = %path.display(), "Workspace has no job record");
    }
    Ok(orphans)
}
