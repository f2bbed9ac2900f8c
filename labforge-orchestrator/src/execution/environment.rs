//! Translation of a job into the provisioning program's environment
//!
//! The program inherits the orchestrator's own environment. On top of it:
//! - `LABFORGE_JOB_ID`, `LABFORGE_WORKSPACE`, `LABFORGE_CONFIG_FILE`
//! - one `LABFORGE_<FIELD>` per top-level scalar field of an object config
//! - credential entries, which win over everything else

use std::collections::HashMap;
use std::path::Path;

use labforge_core::domain::job::JobConfig;
use uuid::Uuid;

use crate::execution::workspace::CONFIG_FILE;

pub const ENV_PREFIX: &str = "LABFORGE_";

/// Builds the extra environment entries for one run
pub fn build(
    job_id: Uuid,
    workspace: &Path,
    config: &JobConfig,
    credentials: HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env = HashMap::new();

    if let Some(fields) = config.as_object() {
        for (key, value) in fields {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            let name = env_name(key);
            if name.len() > ENV_PREFIX.len() {
                env.insert(name, rendered);
            }
        }
    }

    env.insert(format!("{ENV_PREFIX}JOB_ID"), job_id.to_string());
    env.insert(
        format!("{ENV_PREFIX}WORKSPACE"),
        workspace.display().to_string(),
    );
    env.insert(
        format!("{ENV_PREFIX}CONFIG_FILE"),
        workspace.join(CONFIG_FILE).display().to_string(),
    );

    env.extend(credentials);
    env
}

/// `nodeCount` -> `LABFORGE_NODE_COUNT`, `cluster-name` -> `LABFORGE_CLUSTER_NAME`
pub fn env_name(key: &str) -> String {
    let mut name = String::from(ENV_PREFIX);
    let mut prev_lower = false;

    for ch in key.chars() {
        if ch.is_ascii_alphanumeric() {
            if ch.is_ascii_uppercase() && prev_lower {
                name.push('_');
            }
            name.push(ch.to_ascii_uppercase());
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        } else {
            if !name.ends_with('_') {
                name.push('_');
            }
            prev_lower = false;
        }
    }

    while name.len() > ENV_PREFIX.len() && name.ends_with('_') {
        name.pop();
    }
    name
}
