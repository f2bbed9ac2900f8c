//! ID resolver module
//!
//! Resolves UUID prefixes to full job ids so users can type short,
//! unambiguous prefixes instead of full UUIDs.

use anyhow::{Result, anyhow};
use labforge_orchestrator::JobService;
use uuid::Uuid;

use crate::types::IdOrPrefix;

/// Resolve a job ID or prefix to a full UUID
///
/// A full UUID is returned as-is, known or not; lookups report unknown ids.
///
/// # Errors
/// Returns an error if:
/// - No job matches the prefix
/// - Multiple jobs match the prefix (ambiguous)
pub fn resolve_job_id(service: &JobService, id_or_prefix: &IdOrPrefix) -> Result<Uuid> {
    if let Some(uuid) = id_or_prefix.as_uuid() {
        return Ok(uuid);
    }

    let ids: Vec<Uuid> = service.list_jobs().iter().map(|job| job.id).collect();
    resolve_among(&ids, id_or_prefix)
}

fn resolve_among(ids: &[Uuid], id_or_prefix: &IdOrPrefix) -> Result<Uuid> {
    let matches: Vec<Uuid> = ids
        .iter()
        .copied()
        .filter(|id| id_or_prefix.matches(*id))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No job found with ID starting with '{}'", id_or_prefix)),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple jobs: {}",
                id_or_prefix,
                ids.join(", ")
            ))
        }
    }
}
