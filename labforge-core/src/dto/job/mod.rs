//! Job DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::{Job, JobConfig, JobStatus};

/// Request to create a new provisioning job
///
/// The config is accepted as-is; validation belongs to the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateJob {
    #[serde(default)]
    pub config: JobConfig,
}

impl CreateJob {
    pub fn new(config: JobConfig) -> Self {
        Self { config }
    }
}

/// Job summary for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub output_lines: usize,
    pub error: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            created_at: job.created_at,
            updated_at: job.updated_at,
            output_lines: job.output.len(),
            error: job.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_summary_conversion() {
        let mut job = Job::new(
            Uuid::new_v4(),
            serde_json::json!({"region": "eu-west-1"}),
            Utc::now(),
        );
        job.output = vec!["one".to_string(), "two".to_string()];

        let summary = JobSummary::from(&job);
        assert_eq!(summary.id, job.id);
        assert_eq!(summary.status, JobStatus::Pending);
        assert_eq!(summary.output_lines, 2);
        assert!(summary.error.is_none());
    }

    #[test]
    fn test_create_job_accepts_missing_config() {
        let req: CreateJob = serde_json::from_str("{}").unwrap();
        assert!(req.config.is_null());
    }
}
