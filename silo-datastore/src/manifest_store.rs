//! The manifest store: small labeled JSON records on top of contents.
//!
//! Records live in namespace-`m` contents; each content holds a batch of
//! records. The in-memory catalog (id map plus label index) is rebuilt
//! by reading all `m` contents at open and on refresh. Deletion writes a
//! tombstone record; compaction rewrites everything live into a single
//! content and drops the old ones.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use silo_api_types::{ContentId, ManifestId, RepoError, MANIFEST_TYPE_LABEL, NS_MANIFEST};
use silo_tools::time::epoch_i64;

use crate::content::ContentManager;

/// Compact once more than this many manifest contents are live.
const COMPACTION_THRESHOLD: usize = 30;

/// Default refresh cadence for the catalog.
pub const DEFAULT_MANIFEST_CACHE_DURATION: Duration = Duration::from_secs(15 * 60);

/// One manifest record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub id: ManifestId,
    pub labels: BTreeMap<String, String>,
    /// Modification time, epoch seconds.
    pub mtime: i64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl ManifestRecord {
    /// Tombstones win ordering ties so a delete in the same second as
    /// the write sticks.
    fn rank(&self) -> (i64, bool) {
        (self.mtime, self.deleted)
    }
}

#[derive(Serialize, Deserialize)]
struct ManifestBatch {
    records: Vec<ManifestRecord>,
}

pub struct ManifestStore {
    content: Arc<ContentManager>,
    catalog: HashMap<ManifestId, ManifestRecord>,
    label_index: HashMap<(String, String), HashSet<ManifestId>>,
    /// Live `m` contents backing the catalog.
    sources: Vec<ContentId>,
    cache_duration: Duration,
    loaded_at: Instant,
}

impl ManifestStore {
    pub fn open(content: Arc<ContentManager>, cache_duration: Duration) -> Result<Self, Error> {
        let mut store = Self {
            content,
            catalog: HashMap::new(),
            label_index: HashMap::new(),
            sources: Vec::new(),
            cache_duration,
            loaded_at: Instant::now(),
        };
        store.load()?;
        Ok(store)
    }

    fn load(&mut self) -> Result<(), Error> {
        self.catalog.clear();
        self.label_index.clear();
        self.sources.clear();

        let mut sources = Vec::new();
        self.content
            .iterate_contents(Some(NS_MANIFEST), false, &mut |entry| {
                sources.push(entry.id);
                Ok(())
            })?;

        for source in &sources {
            let payload = self
                .content
                .get_content(source)
                .with_context(|| format!("reading manifest content {}", source))?;
            let batch: ManifestBatch = serde_json::from_slice(&payload)
                .map_err(|err| RepoError::Corrupt(format!("manifest content - {}", err)))?;
            for record in batch.records {
                self.apply(record);
            }
        }

        self.sources = sources;
        self.loaded_at = Instant::now();
        Ok(())
    }

    fn apply(&mut self, record: ManifestRecord) {
        match self.catalog.get(&record.id) {
            Some(existing) if existing.rank() >= record.rank() => return,
            _ => (),
        }

        if let Some(old) = self.catalog.remove(&record.id) {
            for (key, value) in &old.labels {
                if let Some(set) = self.label_index.get_mut(&(key.clone(), value.clone())) {
                    set.remove(&old.id);
                }
            }
        }

        if !record.deleted {
            for (key, value) in &record.labels {
                self.label_index
                    .entry((key.clone(), value.clone()))
                    .or_default()
                    .insert(record.id.clone());
            }
        }
        self.catalog.insert(record.id.clone(), record);
    }

    fn persist(&mut self, record: ManifestRecord) -> Result<(), Error> {
        let batch = ManifestBatch {
            records: vec![record.clone()],
        };
        let payload = serde_json::to_vec(&batch)?;
        let source = self.content.write_content(&payload, NS_MANIFEST)?;
        self.sources.push(source);
        self.apply(record);
        self.maybe_compact()?;
        Ok(())
    }

    /// Store a new manifest. The `type` label is mandatory.
    pub fn put(
        &mut self,
        labels: BTreeMap<String, String>,
        payload: Value,
    ) -> Result<ManifestId, Error> {
        if !labels.contains_key(MANIFEST_TYPE_LABEL) {
            bail!("manifest must carry a '{}' label", MANIFEST_TYPE_LABEL);
        }

        let mut raw = [0u8; 8];
        openssl::rand::rand_bytes(&mut raw)?;
        let id = ManifestId::from_random_bytes(raw);

        let record = ManifestRecord {
            id: id.clone(),
            labels,
            mtime: epoch_i64(),
            payload,
            deleted: false,
        };
        self.persist(record)?;
        Ok(id)
    }

    pub fn get(&self, id: &ManifestId) -> Result<&ManifestRecord, Error> {
        match self.catalog.get(id) {
            Some(record) if !record.deleted => Ok(record),
            _ => Err(RepoError::NotFound(format!("manifest {}", id)).into()),
        }
    }

    /// All live manifests whose labels are a superset of `labels`.
    pub fn find(&self, labels: &BTreeMap<String, String>) -> Vec<&ManifestRecord> {
        // narrow via the label index, then verify the full label set
        let mut candidates: Option<HashSet<&ManifestId>> = None;
        for (key, value) in labels {
            let set = match self.label_index.get(&(key.clone(), value.clone())) {
                Some(set) => set,
                None => return Vec::new(),
            };
            candidates = Some(match candidates {
                None => set.iter().collect(),
                Some(current) => current
                    .into_iter()
                    .filter(|id| set.contains(*id))
                    .collect(),
            });
        }

        let ids: Vec<&ManifestId> = match candidates {
            Some(ids) => ids.into_iter().collect(),
            // empty query matches everything live
            None => self
                .catalog
                .values()
                .filter(|record| !record.deleted)
                .map(|record| &record.id)
                .collect(),
        };

        let mut records: Vec<&ManifestRecord> = ids
            .into_iter()
            .filter_map(|id| self.catalog.get(id))
            .filter(|record| !record.deleted)
            .collect();
        records.sort_by_key(|record| (record.mtime, record.id.clone()));
        records
    }

    /// Tombstone a manifest.
    pub fn delete(&mut self, id: &ManifestId) -> Result<(), Error> {
        let record = match self.catalog.get(id) {
            Some(record) if !record.deleted => record,
            _ => return Err(RepoError::NotFound(format!("manifest {}", id)).into()),
        };

        let tombstone = ManifestRecord {
            id: record.id.clone(),
            labels: record.labels.clone(),
            mtime: epoch_i64(),
            payload: Value::Null,
            deleted: true,
        };
        self.persist(tombstone)
    }

    /// Re-read the catalog when the cache duration elapsed (or forced).
    pub fn refresh(&mut self, force: bool) -> Result<(), Error> {
        if force || self.loaded_at.elapsed() >= self.cache_duration {
            self.load()?;
        }
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<(), Error> {
        if self.sources.len() > COMPACTION_THRESHOLD {
            self.compact()?;
        }
        Ok(())
    }

    /// Rewrite all live records into a single content and tombstone the
    /// old manifest contents.
    pub fn compact(&mut self) -> Result<(), Error> {
        let live: Vec<ManifestRecord> = self
            .catalog
            .values()
            .filter(|record| !record.deleted)
            .cloned()
            .collect();

        let batch = ManifestBatch { records: live };
        let payload = serde_json::to_vec(&batch)?;
        let new_source = self.content.write_content(&payload, NS_MANIFEST)?;

        let old_sources = std::mem::take(&mut self.sources);
        for source in old_sources {
            if source == new_source {
                continue;
            }
            match self.content.delete_content(&source) {
                Ok(()) => (),
                Err(err) if silo_api_types::is_not_found(&err) => (),
                Err(err) => return Err(err),
            }
        }
        self.sources = vec![new_source];

        log::debug!("compacted manifest store into content {}", new_source);
        Ok(())
    }

    pub fn live_manifest_count(&self) -> usize {
        self.catalog
            .values()
            .filter(|record| !record.deleted)
            .count()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::content::ContentOptions;
    use silo_blobstore::MemoryBlobStore;
    use silo_tools::CryptConfig;

    fn store() -> ManifestStore {
        let backend = Arc::new(MemoryBlobStore::new());
        let crypt = Arc::new(CryptConfig::new([6u8; 32]).unwrap());
        let content = Arc::new(
            ContentManager::open(
                backend as Arc<dyn silo_blobstore::BlobStore>,
                crypt,
                ContentOptions::default(),
            )
            .unwrap(),
        );
        ManifestStore::open(content, DEFAULT_MANIFEST_CACHE_DURATION).unwrap()
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn put_get_find_delete() {
        let mut manifests = store();

        let id = manifests
            .put(
                labels(&[("type", "snapshot"), ("host", "h1")]),
                serde_json::json!({"n": 1}),
            )
            .unwrap();
        let other = manifests
            .put(
                labels(&[("type", "snapshot"), ("host", "h2")]),
                serde_json::json!({"n": 2}),
            )
            .unwrap();

        assert_eq!(manifests.get(&id).unwrap().payload["n"], 1);

        // superset label matching
        assert_eq!(manifests.find(&labels(&[("type", "snapshot")])).len(), 2);
        let h1 = manifests.find(&labels(&[("type", "snapshot"), ("host", "h1")]));
        assert_eq!(h1.len(), 1);
        assert_eq!(h1[0].id, id);
        assert!(manifests
            .find(&labels(&[("type", "policy")]))
            .is_empty());

        manifests.delete(&id).unwrap();
        assert!(manifests.get(&id).is_err());
        assert_eq!(manifests.find(&labels(&[("type", "snapshot")])).len(), 1);
        assert_eq!(
            manifests.find(&labels(&[("type", "snapshot")]))[0].id,
            other
        );

        // deleting twice reports not found
        assert!(manifests.delete(&id).is_err());
    }

    #[test]
    fn type_label_is_required() {
        let mut manifests = store();
        assert!(manifests
            .put(labels(&[("host", "h1")]), Value::Null)
            .is_err());
    }

    #[test]
    fn catalog_survives_reload() {
        let backend = Arc::new(MemoryBlobStore::new());
        let crypt = Arc::new(CryptConfig::new([6u8; 32]).unwrap());
        let content = Arc::new(
            ContentManager::open(
                Arc::clone(&backend) as Arc<dyn silo_blobstore::BlobStore>,
                Arc::clone(&crypt),
                ContentOptions::default(),
            )
            .unwrap(),
        );

        let id = {
            let mut manifests =
                ManifestStore::open(Arc::clone(&content), DEFAULT_MANIFEST_CACHE_DURATION).unwrap();
            let id = manifests
                .put(labels(&[("type", "policy")]), serde_json::json!({"keep": 7}))
                .unwrap();
            let gone = manifests
                .put(labels(&[("type", "policy")]), serde_json::json!({"keep": 9}))
                .unwrap();
            manifests.delete(&gone).unwrap();
            content.flush().unwrap();
            id
        };

        let content = Arc::new(
            ContentManager::open(
                backend as Arc<dyn silo_blobstore::BlobStore>,
                crypt,
                ContentOptions::default(),
            )
            .unwrap(),
        );
        let manifests = ManifestStore::open(content, DEFAULT_MANIFEST_CACHE_DURATION).unwrap();
        assert_eq!(manifests.get(&id).unwrap().payload["keep"], 7);
        assert_eq!(manifests.live_manifest_count(), 1);
    }

    #[test]
    fn compaction_keeps_catalog_equivalent() {
        let mut manifests = store();

        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                manifests
                    .put(
                        labels(&[("type", "snapshot"), ("n", &i.to_string())]),
                        serde_json::json!(i),
                    )
                    .unwrap(),
            );
        }
        manifests.delete(&ids[0]).unwrap();

        manifests.compact().unwrap();
        assert_eq!(manifests.sources.len(), 1);
        assert_eq!(manifests.live_manifest_count(), 4);
        for id in &ids[1..] {
            manifests.get(id).unwrap();
        }

        // reload from the single compacted content
        let content = Arc::clone(&manifests.content);
        content.flush().unwrap();
        let reloaded = ManifestStore::open(content, DEFAULT_MANIFEST_CACHE_DURATION).unwrap();
        assert_eq!(reloaded.live_manifest_count(), 4);
    }
}
