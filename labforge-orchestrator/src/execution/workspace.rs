//! Workspace management
//!
//! Each job gets `<root>/<job id>` as the working directory of its
//! provisioning run. Keying by job id keeps concurrently created jobs from
//! ever sharing a directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use labforge_core::domain::job::JobConfig;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{JobError, Result};

/// Full job config, as handed to the provisioning program
pub const CONFIG_FILE: &str = "job-config.json";

/// Uploaded template, written when the config carries a `template` string
pub const TEMPLATE_FILE: &str = "template.yaml";

/// Allocates and reclaims per-job working directories
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by a job, whether or not it exists yet
    pub fn path(&self, job_id: Uuid) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    pub fn exists(&self, job_id: Uuid) -> bool {
        self.path(job_id).is_dir()
    }

    /// Creates the job's directory if needed and returns it
    ///
    /// Idempotent: the same id always yields the same path.
    pub fn allocate(&self, job_id: Uuid) -> Result<PathBuf> {
        let path = self.path(job_id);
        std::fs::create_dir_all(&path).map_err(|e| JobError::workspace(&path, e))?;
        debug!(job_id = %job_id, path = %path.display(), "Workspace allocated");
        Ok(path)
    }

    /// Removes the job's directory tree; returns whether anything was removed
    pub fn reclaim(&self, job_id: Uuid) -> Result<bool> {
        let path = self.path(job_id);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(job_id = %job_id, path = %path.display(), "Workspace reclaimed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(JobError::workspace(&path, e)),
        }
    }

    /// Workspace directories whose job id is not in `known`
    pub fn orphans(&self, known: &HashSet<Uuid>) -> Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(JobError::workspace(&self.root, e)),
        };

        let mut orphans = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| JobError::workspace(&self.root, e))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let owned = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| Uuid::parse_str(n).ok())
                .is_some_and(|id| known.contains(&id));

            if !owned {
                orphans.push(path);
            }
        }

        orphans.sort();
        Ok(orphans)
    }
}

/// Materializes the directory and writes the run's input files into it
///
/// Reuses an existing directory, so a workspace can be prepared again.
pub async fn prepare(dir: &Path, config: &JobConfig) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| JobError::workspace(dir, e))?;

    let config_path = dir.join(CONFIG_FILE);
    let rendered = serde_json::to_vec_pretty(config)
        .map_err(|e| JobError::workspace(&config_path, e.into()))?;
    tokio::fs::write(&config_path, rendered)
        .await
        .map_err(|e| JobError::workspace(&config_path, e))?;

    if let Some(template) = config.get("template").and_then(|t| t.as_str()) {
        let template_path = dir.join(TEMPLATE_FILE);
        tokio::fs::write(&template_path, template)
            .await
            .map_err(|e| JobError::workspace(&template_path, e))?;
    }

    Ok(())
}
