//! Shared, serializable data types for the silo repository engine.
//!
//! Everything in this crate is a plain data type: identifiers, snapshot
//! tree records, statistics and the typed error kinds. No I/O happens
//! here.

mod error;
mod ids;
mod snapshot;
mod stats;

pub use error::{
    is_canceled, is_conflict, is_corrupt, is_not_found, is_wrong_passphrase, RepoError,
};
pub use ids::{
    ContentId, ManifestId, ObjectId, CONTENT_DIGEST_SIZE, NS_DIRECTORY, NS_INDIRECT, NS_MANIFEST,
    NS_NONE,
};
pub use snapshot::{
    DirEntry, DirSummary, DirectoryManifest, EntryKind, SnapshotManifest, SnapshotSource,
};
pub use stats::{MaintenanceStats, RepositoryStatus, SnapshotStats};

/// Manifest label key that every manifest must carry.
pub const MANIFEST_TYPE_LABEL: &str = "type";

/// Manifest type used for snapshot manifests.
pub const MANIFEST_TYPE_SNAPSHOT: &str = "snapshot";

/// Manifest type used for the per-repository maintenance schedule.
pub const MANIFEST_TYPE_MAINTENANCE: &str = "maintenance";

/// Manifest type used for policy records.
pub const MANIFEST_TYPE_POLICY: &str = "policy";
