//! The snapshot engine.
//!
//! Walks one or more source trees, hashes changed files through the
//! object manager on a worker pool, reuses object ids from the previous
//! snapshot when metadata matches, and persists a snapshot manifest.
//! Long uploads periodically flush and write checkpoint manifests so
//! progress survives crashes.

mod ignore;
mod upload;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Error};

use silo_api_types::{ManifestId, RepoError, SnapshotManifest, SnapshotSource};
use silo_datastore::{default_identity, Repository};
use silo_tools::CancelToken;

pub use ignore::{IgnoreStack, IGNORE_FILE_NAME};
pub use upload::{PLACEHOLDER_DIR_MARKER, PLACEHOLDER_SUFFIX};

/// Reason recorded on checkpoint manifests.
pub const CHECKPOINT_REASON: &str = "checkpoint";

#[derive(Clone)]
pub struct SnapshotOptions {
    pub description: String,
    pub tags: BTreeMap<String, String>,
    /// Hasher/uploader worker count, defaults to the CPU count.
    pub parallelism: usize,
    pub checkpoint_interval: Duration,
    /// Record unreadable files as error entries instead of failing.
    pub ignore_file_errors: bool,
    /// Record unreadable directories as error entries instead of
    /// failing.
    pub ignore_dir_errors: bool,
    /// Policy-level exclusion patterns, applied before `.siloignore`
    /// files.
    pub ignore_patterns: Vec<String>,
    /// Snapshot named pipes as regular files (`REPO_SNAPSHOT_NAMED_PIPES`).
    pub snapshot_named_pipes: bool,
    /// Reuse object ids from the previous snapshot when size and mtime
    /// match.
    pub use_previous_manifest: bool,
}

fn env_truthy(name: &str) -> bool {
    matches!(
        std::env::var(name).as_deref(),
        Ok("1") | Ok("true") | Ok("yes") | Ok("on")
    )
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            description: String::new(),
            tags: BTreeMap::new(),
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            checkpoint_interval: Duration::from_secs(45 * 60),
            ignore_file_errors: false,
            ignore_dir_errors: false,
            ignore_patterns: Vec::new(),
            snapshot_named_pipes: env_truthy("REPO_SNAPSHOT_NAMED_PIPES"),
            use_previous_manifest: true,
        }
    }
}

#[derive(Debug)]
pub struct SnapshotResult {
    pub manifest_id: ManifestId,
    pub manifest: SnapshotManifest,
}

impl SnapshotResult {
    /// The `PartialSuccess` error kind when entries were tolerated, for
    /// callers that map it to an exit code.
    pub fn partial_success(&self) -> Option<RepoError> {
        let stats = &self.manifest.stats;
        if stats.ignored_error_count > 0 {
            Some(RepoError::PartialSuccess {
                ignored: stats.ignored_error_count,
                fatal: stats.fatal_error_count,
            })
        } else {
            None
        }
    }
}

/// The source identity for a set of paths: single path, or the combined
/// synthetic root.
pub fn snapshot_source(paths: &[PathBuf]) -> Result<SnapshotSource, Error> {
    if paths.is_empty() {
        bail!("no snapshot source given");
    }

    let identity = default_identity();
    let (user_name, host) = identity
        .split_once('@')
        .map(|(user, host)| (user.to_string(), host.to_string()))
        .unwrap_or_else(|| (identity.clone(), "localhost".to_string()));

    let path = paths
        .iter()
        .map(|p| p.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("+");

    Ok(SnapshotSource {
        host,
        user_name,
        path,
    })
}

/// Create a snapshot of the given source paths.
///
/// With more than one path the sources are combined under a synthetic
/// root listing them as children; duplicate child names are an error.
pub fn create_snapshot(
    repo: &Repository,
    paths: &[PathBuf],
    options: &SnapshotOptions,
    cancel: &CancelToken,
) -> Result<SnapshotResult, Error> {
    upload::Uploader::new(repo, options, cancel)?.run(paths)
}
