//! Job Persistence
//!
//! One pretty-printed JSON file per job under the data directory. Writes go
//! through a temp file in the same directory which is fsynced and renamed
//! over the real name, so a crash mid-save leaves the previous record intact.

use std::io::Write;
use std::path::{Path, PathBuf};

use labforge_core::domain::job::Job;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{JobError, Result};

const RECORD_EXTENSION: &str = "json";
const TEMP_SUFFIX: &str = ".tmp";

/// Records read back from the data directory
#[derive(Debug, Default)]
pub struct LoadedJobs {
    pub jobs: Vec<Job>,
    /// Files that were present but did not yield a job
    pub skipped: usize,
}

/// File-backed storage for job records
#[derive(Debug, Clone)]
pub struct JobPersistence {
    data_dir: PathBuf,
}

impl JobPersistence {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the record file for a job
    pub fn path_for(&self, id: Uuid) -> PathBuf {
        self.data_dir.join(format!("{id}.{RECORD_EXTENSION}"))
    }

    /// Atomically writes a job record, replacing any previous version
    pub fn write(&self, job: &Job) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| JobError::persistence(&self.data_dir, e))?;

        let path = self.path_for(job.id);
        let content =
            serde_json::to_vec_pretty(job).map_err(|e| JobError::persistence(&path, e))?;

        let temp_path = self.data_dir.join(format!(
            ".{}.{}.{}{}",
            job.id,
            RECORD_EXTENSION,
            Uuid::new_v4().simple(),
            TEMP_SUFFIX
        ));

        if let Err(e) = write_synced(&temp_path, &content) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(JobError::persistence(&temp_path, e));
        }

        if let Err(e) = std::fs::rename(&temp_path, &path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(JobError::persistence(&path, e));
        }

        debug!(job_id = %job.id, path = %path.display(), "Job record saved");
        Ok(())
    }

    /// Deletes a job record; a missing file is not an error
    pub fn delete(&self, id: Uuid) -> Result<()> {
        let path = self.path_for(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JobError::persistence(&path, e)),
        }
    }

    /// Reads every job record in the data directory
    ///
    /// Unreadable or malformed files are logged and skipped; only a data
    /// directory that exists but cannot be listed is an error.
    pub fn load_all(&self) -> Result<LoadedJobs> {
        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.data_dir.display(), "Data directory missing, nothing to load");
                return Ok(LoadedJobs::default());
            }
            Err(e) => return Err(JobError::persistence(&self.data_dir, e)),
        };

        let mut loaded = LoadedJobs::default();

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %self.data_dir.display(), error = %e, "Failed to read directory entry");
                    loaded.skipped += 1;
                    continue;
                }
            };

            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            // Leftovers from a save interrupted before its rename
            if file_name.starts_with('.') && file_name.ends_with(TEMP_SUFFIX) {
                debug!(path = %path.display(), "Removing stale temp file");
                let _ = std::fs::remove_file(&path);
                continue;
            }

            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }

            match read_record(&path) {
                Ok(Some(job)) => loaded.jobs.push(job),
                Ok(None) => {
                    debug!(path = %path.display(), "Skipping empty job record");
                    loaded.skipped += 1;
                }
                Err(reason) => {
                    warn!(path = %path.display(), reason = %reason, "Skipping unreadable job record");
                    loaded.skipped += 1;
                }
            }
        }

        Ok(loaded)
    }
}

fn write_synced(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(content)?;
    file.sync_all()
}

/// Parses one record file.
///
/// `Ok(None)` covers the benign empty shapes: zero bytes, whitespace,
/// `null` and `[]`.
fn read_record(path: &Path) -> std::result::Result<Option<Job>, String> {
    let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    if raw.trim().is_empty() {
        return Ok(None);
    }

    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| e.to_string())?;
    match &value {
        serde_json::Value::Null => return Ok(None),
        serde_json::Value::Array(items) if items.is_empty() => return Ok(None),
        _ => {}
    }

    let job: Job = serde_json::from_value(value).map_err(|e| e.to_string())?;

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    if stem != job.id.to_string() {
        return Err(format!("record id {} does not match file name", job.id));
    }

    Ok(Some(job))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use labforge_core::domain::job::JobStatus;

    fn sample_job() -> Job {
        let mut job = Job::new(
            Uuid::new_v4(),
            serde_json::json!({"region": "eu-west-1"}),
            Utc::now(),
        );
        job.status = JobStatus::Failed;
        job.output = vec!["x".to_string(), "y".to_string()];
        job.error = Some("boom".to_string());
        job
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JobPersistence::new(dir.path());
        let job = sample_job();

        persistence.write(&job).unwrap();
        let loaded = persistence.load_all().unwrap();

        assert_eq!(loaded.skipped, 0);
        assert_eq!(loaded.jobs, vec![job]);
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JobPersistence::new(dir.path());
        let job = sample_job();

        persistence.write(&job).unwrap();
        persistence.write(&job).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{}.json", job.id)]);
    }

    #[test]
    fn test_write_creates_missing_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JobPersistence::new(dir.path().join("nested").join("jobs"));

        persistence.write(&sample_job()).unwrap();
        assert_eq!(persistence.load_all().unwrap().jobs.len(), 1);
    }

    #[test]
    fn test_load_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JobPersistence::new(dir.path().join("absent"));

        let loaded = persistence.load_all().unwrap();
        assert!(loaded.jobs.is_empty());
        assert_eq!(loaded.skipped, 0);
    }

    #[test]
    fn test_load_skips_corrupt_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JobPersistence::new(dir.path());
        let job = sample_job();
        persistence.write(&job).unwrap();

        let truncated = serde_json::to_string(&sample_job()).unwrap();
        let truncated = &truncated[..truncated.len() / 2];
        std::fs::write(dir.path().join(format!("{}.json", Uuid::new_v4())), truncated).unwrap();
        std::fs::write(dir.path().join(format!("{}.json", Uuid::new_v4())), "").unwrap();
        std::fs::write(dir.path().join(format!("{}.json", Uuid::new_v4())), "null").unwrap();
        std::fs::write(dir.path().join(format!("{}.json", Uuid::new_v4())), "[]").unwrap();
        std::fs::write(dir.path().join(format!("{}.json", Uuid::new_v4())), "not json").unwrap();
        std::fs::write(
            dir.path().join(format!("{}.json", Uuid::new_v4())),
            r#"{"id": 42}"#,
        )
        .unwrap();

        let loaded = persistence.load_all().unwrap();
        assert_eq!(loaded.jobs, vec![job]);
        assert_eq!(loaded.skipped, 6);
    }

    #[test]
    fn test_load_skips_record_under_wrong_name() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JobPersistence::new(dir.path());
        let job = sample_job();

        std::fs::write(
            dir.path().join(format!("{}.json", Uuid::new_v4())),
            serde_json::to_string(&job).unwrap(),
        )
        .unwrap();

        let loaded = persistence.load_all().unwrap();
        assert!(loaded.jobs.is_empty());
        assert_eq!(loaded.skipped, 1);
    }

    #[test]
    fn test_load_removes_stale_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JobPersistence::new(dir.path());
        let stale = dir.path().join(format!(".{}.json.abc.tmp", Uuid::new_v4()));
        std::fs::write(&stale, "{\"half\":").unwrap();

        let loaded = persistence.load_all().unwrap();
        assert!(loaded.jobs.is_empty());
        assert_eq!(loaded.skipped, 0);
        assert!(!stale.exists());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = JobPersistence::new(dir.path());
        let job = sample_job();
        persistence.write(&job).unwrap();

        persistence.delete(job.id).unwrap();
        assert!(!persistence.path_for(job.id).exists());
        persistence.delete(job.id).unwrap();
    }
}
