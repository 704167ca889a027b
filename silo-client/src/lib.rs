//! Snapshot creation and restore on top of the silo storage core.

pub mod restore;
pub mod snapshot;
pub mod verify;

pub use restore::archive::{restore_to_archive, ArchiveFormat};
pub use verify::{verify_snapshot, VerifyOptions, VerifyReport};
pub use restore::{
    resolve_root, restore_snapshot, restore_to_directory, RestoreOptions, RestoreStats,
};
pub use snapshot::{
    create_snapshot, snapshot_source, SnapshotOptions, SnapshotResult, CHECKPOINT_REASON,
    IGNORE_FILE_NAME, PLACEHOLDER_DIR_MARKER, PLACEHOLDER_SUFFIX,
};
