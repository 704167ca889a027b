use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{ManifestId, ObjectId};
use crate::stats::SnapshotStats;

/// Identity of a snapshot source: which user on which host snapshots
/// which path.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSource {
    pub host: String,
    pub user_name: String,
    pub path: String,
}

impl fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user_name, self.host, self.path)
    }
}

/// Kind of a directory entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Error,
}

/// Aggregated statistics over a directory subtree.
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirSummary {
    pub total_size: u64,
    pub file_count: u64,
    pub dir_count: u64,
    pub symlink_count: u64,
    pub error_count: u64,
    pub max_mtime: i64,
}

impl DirSummary {
    pub fn add(&mut self, other: &DirSummary) {
        self.total_size += other.total_size;
        self.file_count += other.file_count;
        self.dir_count += other.dir_count;
        self.symlink_count += other.symlink_count;
        self.error_count += other.error_count;
        self.max_mtime = self.max_mtime.max(other.max_mtime);
    }
}

fn u32_is_zero(value: &u32) -> bool {
    *value == 0
}

/// One entry of a directory manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    /// Sub-second part of `mtime`, nanoseconds.
    #[serde(default, skip_serializing_if = "u32_is_zero")]
    pub mtime_ns: u32,
    /// File bytes or directory manifest, absent for symlinks and errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obj: Option<ObjectId>,
    /// Symlink target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Error message for entries that could not be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summ: Option<DirSummary>,
}

impl DirEntry {
    pub fn error_entry(name: String, message: String) -> Self {
        Self {
            name,
            kind: EntryKind::Error,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            mtime_ns: 0,
            obj: None,
            target: None,
            error: Some(message),
            summ: None,
        }
    }
}

/// Serialized listing of one directory: a summary plus the children,
/// sorted by name.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryManifest {
    pub summary: DirSummary,
    pub entries: Vec<DirEntry>,
}

impl DirectoryManifest {
    /// Look up a child by name. Entries are sorted, so this is a binary
    /// search.
    pub fn lookup(&self, name: &str) -> Option<&DirEntry> {
        self.entries
            .binary_search_by(|entry| entry.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.entries[idx])
    }
}

/// Point-in-time capture of one source, persisted in the manifest store
/// under `type=snapshot`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ManifestId>,
    pub source: SnapshotSource,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub start_time: i64,
    pub end_time: i64,
    pub stats: SnapshotStats,
    /// Reason this snapshot is incomplete (e.g. `checkpoint`), absent for
    /// complete snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete: Option<String>,
    pub root_entry: DirEntry,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retention_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl SnapshotManifest {
    pub fn is_complete(&self) -> bool {
        self.incomplete.is_none()
    }

    /// Labels under which a snapshot manifest is stored.
    pub fn labels(source: &SnapshotSource) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(crate::MANIFEST_TYPE_LABEL.to_string(), crate::MANIFEST_TYPE_SNAPSHOT.to_string());
        labels.insert("host".to_string(), source.host.clone());
        labels.insert("username".to_string(), source.user_name.clone());
        labels.insert("path".to_string(), source.path.clone());
        labels
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn file_entry(name: &str) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            kind: EntryKind::File,
            mode: 0o644,
            uid: 1000,
            gid: 1000,
            size: 10,
            mtime: 1_700_000_000,
            mtime_ns: 0,
            obj: Some(ObjectId::Inline(vec![1, 2, 3])),
            target: None,
            error: None,
            summ: None,
        }
    }

    #[test]
    fn directory_manifest_lookup() {
        let manifest = DirectoryManifest {
            summary: DirSummary::default(),
            entries: vec![file_entry("a"), file_entry("b"), file_entry("c")],
        };
        assert_eq!(manifest.lookup("b").unwrap().name, "b");
        assert!(manifest.lookup("z").is_none());
    }

    #[test]
    fn snapshot_manifest_json_field_names() {
        let manifest = SnapshotManifest {
            id: None,
            source: SnapshotSource {
                host: "host1".into(),
                user_name: "alice".into(),
                path: "/data".into(),
            },
            description: String::new(),
            start_time: 100,
            end_time: 200,
            stats: SnapshotStats::default(),
            incomplete: None,
            root_entry: file_entry("root"),
            retention_reasons: Vec::new(),
            tags: BTreeMap::new(),
        };

        let value = serde_json::to_value(&manifest).unwrap();
        assert!(value.get("startTime").is_some());
        assert!(value.get("rootEntry").is_some());
        assert_eq!(value["source"]["userName"], "alice");
        // absent optional fields are omitted entirely
        assert!(value.get("incomplete").is_none());
    }
}
