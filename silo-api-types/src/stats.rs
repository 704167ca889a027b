use serde::{Deserialize, Serialize};

/// Counters collected while creating one snapshot.
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    pub total_file_count: u64,
    pub total_file_size: u64,
    pub total_directory_count: u64,
    pub excluded_file_count: u64,
    /// Files whose object id was reused from the previous snapshot.
    pub cached_files: u64,
    /// Files that were hashed and uploaded.
    pub non_cached_files: u64,
    pub ignored_error_count: u64,
    pub fatal_error_count: u64,
}

/// Result of a maintenance run.
///
/// The count/byte pairs classify every known content; the remaining
/// counters report the housekeeping work performed.
#[derive(Clone, Default, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MaintenanceStats {
    pub in_use_count: u64,
    pub in_use_bytes: u64,
    pub unused_count: u64,
    pub unused_bytes: u64,
    pub system_count: u64,
    pub system_bytes: u64,
    pub too_recent_count: u64,
    pub too_recent_bytes: u64,
    pub undeleted_count: u64,
    pub undeleted_bytes: u64,

    pub compacted_index_blobs: u64,
    pub rewritten_packs: u64,
    pub deleted_blobs: u64,
    pub swept_sessions: u64,
}

/// Descriptive state of an opened repository.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RepositoryStatus {
    pub unique_id: String,
    pub format_version: u32,
    pub hash: String,
    pub encryption: String,
    pub compression: bool,
    pub splitter_min: u32,
    pub splitter_avg: u32,
    pub splitter_max: u32,
    pub read_only: bool,
}
