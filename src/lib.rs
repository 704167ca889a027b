//! silo - deduplicating, encrypted, content-addressed snapshot
//! repository engine.
//!
//! This crate is the facade tying the workspace together: repository
//! connection helpers, the local connection config file, and re-exports
//! of the layer crates. The heavy lifting lives in `silo-datastore`
//! (content/object/manifest storage, maintenance) and `silo-client`
//! (snapshot and restore engines).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Error};

pub mod config;

pub use silo_api_types as api_types;
pub use silo_blobstore as blobstore;
pub use silo_client as client;
pub use silo_datastore as datastore;
pub use silo_key_config as key_config;
pub use silo_tools as tools;

pub use config::ConnectionConfig;
pub use silo_api_types::{
    ContentId, DirEntry, ManifestId, ObjectId, RepoError, SnapshotManifest, SnapshotSource,
};
pub use silo_client::{
    create_snapshot, restore_snapshot, restore_to_directory, SnapshotOptions, SnapshotResult,
};
pub use silo_datastore::{
    maintenance, Repository, RepositoryOptions, SAFETY_FULL, SAFETY_NONE,
};
pub use silo_key_config::{FormatCreateOptions, Kdf};

use silo_blobstore::{BlobStore, FilesystemBlobStore};

/// Build the blob store backend described by a connection config.
pub fn open_backend(config: &ConnectionConfig) -> Result<Arc<dyn BlobStore>, Error> {
    match config.backend.kind.as_str() {
        "filesystem" => Ok(Arc::new(FilesystemBlobStore::open(
            PathBuf::from(&config.backend.path),
        )?)),
        other => bail!("unsupported backend kind '{}'", other),
    }
}

/// Connect to the repository described by a config file.
///
/// The passphrase falls back to `REPO_PASSWORD` when not given.
pub fn connect(
    config_path: &Path,
    passphrase: Option<&[u8]>,
) -> Result<Repository, Error> {
    let config = ConnectionConfig::load(config_path)?;
    let store = open_backend(&config)?;

    let passphrase = match passphrase {
        Some(passphrase) => passphrase.to_vec(),
        None => silo_key_config::passphrase_from_env()?,
    };

    let options = RepositoryOptions {
        read_only: config.read_only,
        cache: config
            .cache_directory
            .as_ref()
            .map(|dir| (PathBuf::from(dir), config.cache_budget_bytes)),
        ..Default::default()
    };

    Repository::open(store, &passphrase, options)
}
