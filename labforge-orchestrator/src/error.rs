//! Error taxonomy for the job subsystem

use std::path::PathBuf;

use labforge_core::domain::job::JobStatus;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for job operations
pub type Result<T> = std::result::Result<T, JobError>;

/// Errors surfaced by synchronous job operations
///
/// Failures of the provisioning run itself are not returned through this
/// type: they are recorded in the job's `error` field.
#[derive(Debug, Error)]
pub enum JobError {
    /// The operation referenced an unknown job id
    #[error("job not found: {0}")]
    NotFound(Uuid),

    /// A mutation was attempted that the lifecycle forbids
    #[error("job {id} in state {from} cannot {action}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        action: String,
    },

    /// An execution for this job is already in flight in this process
    #[error("job {0} is already being executed")]
    AlreadyRunning(Uuid),

    /// Disk I/O on a persisted job record failed
    #[error("persistence failure at {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A workspace directory could not be prepared or removed
    #[error("workspace failure at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The credential provider could not supply secrets
    #[error("credentials unavailable: {0}")]
    Credentials(String),
}

impl JobError {
    pub(crate) fn invalid_transition(id: Uuid, from: JobStatus, action: impl Into<String>) -> Self {
        Self::InvalidTransition {
            id,
            from,
            action: action.into(),
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: impl Into<std::io::Error>) -> Self {
        Self::Persistence {
            path: path.into(),
            source: source.into(),
        }
    }

    pub(crate) fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Workspace {
            path: path.into(),
            source,
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
