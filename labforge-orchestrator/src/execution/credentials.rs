//! Credential providers
//!
//! Provisioning secrets reach the program as extra environment entries. The
//! job subsystem treats them as opaque key/value pairs.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{JobError, Result};

/// Supplies provisioning secrets as environment entries
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> Result<HashMap<String, String>>;
}

/// Fixed set of credentials
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    entries: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    /// Adds an entry
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self) -> Result<HashMap<String, String>> {
        Ok(self.entries.clone())
    }
}

/// Credentials read from a `KEY=VALUE` file on every run
///
/// Re-reading lets operators rotate secrets without a restart.
#[derive(Debug, Clone)]
pub struct EnvFileCredentials {
    path: PathBuf,
}

impl EnvFileCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CredentialProvider for EnvFileCredentials {
    fn credentials(&self) -> Result<HashMap<String, String>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            JobError::Credentials(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        parse_env_file(&content)
    }
}

/// Parses `KEY=VALUE` lines; blank lines and `#` comments are ignored,
/// a leading `export ` is tolerated and matching surrounding quotes stripped.
pub fn parse_env_file(content: &str) -> Result<HashMap<String, String>> {
    let mut entries = HashMap::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line.split_once('=').ok_or_else(|| {
            JobError::Credentials(format!("line {}: expected KEY=VALUE", idx + 1))
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(JobError::Credentials(format!("line {}: empty key", idx + 1)));
        }

        entries.insert(key.to_string(), unquote(value.trim()).to_string());
    }

    Ok(entries)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
