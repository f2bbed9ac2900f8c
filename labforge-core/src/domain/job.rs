//! Job domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque description of what a job provisions.
///
/// The job subsystem never interprets this beyond translating top-level
/// fields into the provisioning program's environment. `null` is valid.
pub type JobConfig = serde_json::Value;

/// A provisioning job and its history
///
/// Structure shared between the orchestrator (stores, persists, mutates) and
/// the CLI (displays). Persisted as one JSON document per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    #[serde(default)]
    pub config: JobConfig,
    /// Lines produced by the provisioning run, in emission order
    #[serde(default)]
    pub output: Vec<String>,
    /// Set only when the job is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set only when the job is `Completed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<JobArtifacts>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates a fresh `Pending` job with empty output
    pub fn new(id: Uuid, config: JobConfig, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            config,
            output: Vec::new(),
            error: None,
            artifacts: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Job lifecycle status
///
/// `Pending -> Running -> {Completed | Failed}`. Terminal states accept no
/// further transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Returns true for `Completed` and `Failed`
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal forward transition
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "Pending"),
            JobStatus::Running => write!(f, "Running"),
            JobStatus::Completed => write!(f, "Completed"),
            JobStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Structured results of a successful provisioning run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobArtifacts {
    /// Kubeconfig for the provisioned cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    /// Connection settings for the lab's Coder workspace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coder_config: Option<serde_json::Value>,
}

impl JobArtifacts {
    pub fn is_empty(&self) -> bool {
        self.kubeconfig.is_none() && self.coder_config.is_none()
    }
}
