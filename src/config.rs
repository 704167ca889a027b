//! Local connection configuration.
//!
//! A small JSON file on the client machine records how to reach the
//! blob backend and which identity/cache settings to use. All
//! repository-global state lives in the blob store itself; this file
//! only bootstraps the connection.

use std::path::Path;

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use silo_datastore::default_identity;
use silo_tools::fs::{file_get_contents, replace_file};

/// Default cache budget when a cache directory is configured.
pub const DEFAULT_CACHE_BUDGET: u64 = 5 * 1024 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackendConfig {
    /// Backend driver, currently `filesystem`.
    pub kind: String,
    /// Driver-specific location (directory path for `filesystem`).
    pub path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConnectionConfig {
    pub backend: BackendConfig,
    /// `user@host` identity recorded in snapshots and maintenance
    /// ownership.
    pub identity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_directory: Option<String>,
    #[serde(default = "default_cache_budget")]
    pub cache_budget_bytes: u64,
    #[serde(default)]
    pub read_only: bool,
}

fn default_cache_budget() -> u64 {
    DEFAULT_CACHE_BUDGET
}

impl ConnectionConfig {
    pub fn filesystem<P: AsRef<Path>>(store_path: P) -> Self {
        Self {
            backend: BackendConfig {
                kind: "filesystem".to_string(),
                path: store_path.as_ref().to_string_lossy().into_owned(),
            },
            identity: default_identity(),
            cache_directory: None,
            cache_budget_bytes: DEFAULT_CACHE_BUDGET,
            read_only: false,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let data = file_get_contents(&path)?;
        serde_json::from_slice(&data)
            .with_context(|| format!("unable to parse config {:?}", path.as_ref()))
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(self)?;
        replace_file(path, &data, false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.config");

        let mut config = ConnectionConfig::filesystem("/srv/backup-store");
        config.cache_directory = Some("/var/cache/silo".to_string());
        config.save(&path).unwrap();

        let loaded = ConnectionConfig::load(&path).unwrap();
        assert_eq!(loaded.backend.kind, "filesystem");
        assert_eq!(loaded.backend.path, "/srv/backup-store");
        assert_eq!(loaded.cache_directory.as_deref(), Some("/var/cache/silo"));
        assert_eq!(loaded.cache_budget_bytes, DEFAULT_CACHE_BUDGET);
        assert!(!loaded.read_only);
    }
}
