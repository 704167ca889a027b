//! The content-addressed storage layer.
//!
//! `write_content` turns plaintext bytes into a stable [`ContentId`] with
//! at-most-once storage: the id is the HMAC of the bytes, duplicates are
//! served from the index. New contents append to a pending pack buffer
//! (data or metadata, by namespace); full packs upload on a worker pool
//! so hashing never stalls on the network. `flush` makes everything
//! durable and publishes one index blob into the current epoch.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, RwLock};

use anyhow::{Context, Error};

use silo_api_types::{is_not_found, ContentId, RepoError, NS_NONE};
use silo_blobstore::{names, BlobStore, PutOptions};
use silo_tools::time::{epoch_i64, epoch_nanos_i64};
use silo_tools::{CancelToken, CryptConfig, WorkerPool};

use crate::epoch::{load_all_indexes, write_index_blob, EpochOptions, EpochView};
use crate::frame::DataFrame;
use crate::index::{CombinedIndex, IndexEntry};
use crate::pack::{read_pack_index, PackBuilder, DEFAULT_PACK_TARGET_SIZE};

#[derive(Clone, Debug)]
pub struct ContentOptions {
    pub pack_target_size: usize,
    pub compression: bool,
    pub upload_threads: usize,
    pub epoch: EpochOptions,
}

impl Default for ContentOptions {
    fn default() -> Self {
        Self {
            pack_target_size: DEFAULT_PACK_TARGET_SIZE,
            compression: true,
            upload_threads: 4,
            epoch: EpochOptions::default(),
        }
    }
}

/// Worker pool uploading finished packs. Tracks in-flight uploads so
/// `flush` can wait for durability before publishing the index; a
/// failed upload cancels the pool's token and fails the next wait.
struct UploadPool {
    pool: WorkerPool<(String, Vec<u8>)>,
    in_flight: Arc<(Mutex<usize>, Condvar)>,
}

impl UploadPool {
    fn new(store: Arc<dyn BlobStore>, threads: usize) -> Self {
        let in_flight = Arc::new((Mutex::new(0usize), Condvar::new()));

        let tracker = Arc::clone(&in_flight);
        let pool = WorkerPool::spawn(
            "pack-upload",
            threads,
            CancelToken::new(),
            move |(name, data): (String, Vec<u8>)| {
                let result = store
                    .put(&name, &data, &PutOptions::default())
                    .with_context(|| format!("upload of pack '{}'", name));
                let (count, done) = &*tracker;
                *count.lock().unwrap() -= 1;
                done.notify_all();
                result
            },
        );

        Self { pool, in_flight }
    }

    fn submit(&self, name: String, data: Vec<u8>) -> Result<(), Error> {
        {
            let (count, _) = &*self.in_flight;
            *count.lock().unwrap() += 1;
        }
        if let Err(err) = self.pool.dispatch((name, data)) {
            let (count, done) = &*self.in_flight;
            *count.lock().unwrap() -= 1;
            done.notify_all();
            return Err(err);
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<(), Error> {
        let (count, done) = &*self.in_flight;
        let mut pending = count.lock().unwrap();
        while *pending > 0 {
            pending = done.wait(pending).unwrap();
        }
        drop(pending);

        self.pool.cancel_token().check()
    }
}

struct ContentState {
    data_pack: PackBuilder,
    meta_pack: PackBuilder,
    /// Entries written since the last flush, keyed by id. Shadows the
    /// committed index.
    pending: HashMap<ContentId, IndexEntry>,
}

pub struct ContentManager {
    store: Arc<dyn BlobStore>,
    crypt: Arc<CryptConfig>,
    options: ContentOptions,
    state: Mutex<ContentState>,
    committed: RwLock<CombinedIndex>,
    uploads: UploadPool,
}

fn nonce_input(id: &ContentId) -> Vec<u8> {
    let mut input = Vec::with_capacity(33);
    input.push(id.namespace());
    input.extend_from_slice(id.digest());
    input
}

impl ContentManager {
    /// Open the content layer: loads the merged index from all index
    /// blobs.
    pub fn open(
        store: Arc<dyn BlobStore>,
        crypt: Arc<CryptConfig>,
        options: ContentOptions,
    ) -> Result<Self, Error> {
        let committed = load_all_indexes(store.as_ref(), &crypt)?;
        let uploads = UploadPool::new(Arc::clone(&store), options.upload_threads);

        Ok(Self {
            store,
            crypt,
            options,
            state: Mutex::new(ContentState {
                data_pack: PackBuilder::new(false),
                meta_pack: PackBuilder::new(true),
                pending: HashMap::new(),
            }),
            committed: RwLock::new(committed),
            uploads,
        })
    }

    pub fn crypt(&self) -> &CryptConfig {
        &self.crypt
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Embed a format blob recovery copy in the first data pack. Called
    /// once right after repository creation.
    pub fn set_format_prelude(&self, format_bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        assert!(state.data_pack.is_empty());
        state.data_pack.set_format_prelude(format_bytes);
    }

    /// Compute the id `write_content` would assign without storing
    /// anything.
    pub fn content_id(&self, data: &[u8], namespace: u8) -> ContentId {
        ContentId::new(namespace, self.crypt.compute_digest(data))
    }

    /// Store bytes under their content id. Returns the existing id
    /// without touching the backend when the content is already present
    /// and live.
    pub fn write_content(&self, data: &[u8], namespace: u8) -> Result<ContentId, Error> {
        let id = self.content_id(data, namespace);

        if self.is_live(&id) {
            return Ok(id);
        }

        let iv = self.crypt.derive_nonce(&nonce_input(&id));
        let frame = DataFrame::encode(data, Some((&self.crypt, iv)), self.options.compression)
            .context("encoding content")?;

        let mut state = self.state.lock().unwrap();

        // a racing writer may have stored it while we encoded
        if let Some(entry) = state.pending.get(&id) {
            if !entry.deleted {
                return Ok(id);
            }
        }

        let entry = self.append_locked(&mut state, id, &frame)?;
        state.pending.insert(id, entry);
        Ok(id)
    }

    fn append_locked(
        &self,
        state: &mut ContentState,
        id: ContentId,
        frame: &DataFrame,
    ) -> Result<IndexEntry, Error> {
        let metadata = id.namespace() != NS_NONE;
        let target = self.options.pack_target_size;

        let builder = if metadata {
            &mut state.meta_pack
        } else {
            &mut state.data_pack
        };

        if !builder.is_empty() && builder.size() + frame.raw().len() > target {
            self.rotate_locked(state, metadata)?;
        }

        let builder = if metadata {
            &mut state.meta_pack
        } else {
            &mut state.data_pack
        };
        Ok(builder.append(id, frame))
    }

    fn rotate_locked(&self, state: &mut ContentState, metadata: bool) -> Result<(), Error> {
        let slot = if metadata {
            &mut state.meta_pack
        } else {
            &mut state.data_pack
        };
        if slot.is_empty() {
            return Ok(());
        }

        let builder = std::mem::replace(slot, PackBuilder::new(metadata));
        let finished = builder.finish(&self.crypt)?;
        log::debug!(
            "uploading pack '{}' ({} bytes)",
            finished.name,
            finished.data.len()
        );
        self.uploads.submit(finished.name, finished.data)
    }

    /// Make all written contents durable and publish their index blob
    /// into the current epoch.
    pub fn flush(&self) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();

        self.rotate_locked(&mut state, false)?;
        self.rotate_locked(&mut state, true)?;

        self.uploads.wait_idle()?;

        if state.pending.is_empty() {
            return Ok(());
        }

        let pending: Vec<IndexEntry> = state.pending.values().cloned().collect();
        let view = EpochView::scan(self.store.as_ref())?;
        let epoch = view.write_epoch(&self.options.epoch, epoch_i64());
        let name = write_index_blob(self.store.as_ref(), &self.crypt, epoch, &pending)?;
        log::debug!("wrote index blob '{}' ({} entries)", name, pending.len());

        let mut committed = self.committed.write().unwrap();
        committed.merge_many(state.pending.drain().map(|(_, entry)| entry));

        Ok(())
    }

    /// The authoritative index entry for an id, tombstones included.
    pub fn best_entry(&self, id: &ContentId) -> Option<IndexEntry> {
        if let Some(entry) = self.state.lock().unwrap().pending.get(id) {
            return Some(entry.clone());
        }
        self.committed.read().unwrap().best(id).cloned()
    }

    pub fn is_live(&self, id: &ContentId) -> bool {
        matches!(self.best_entry(id), Some(entry) if !entry.deleted)
    }

    /// Fetch and decode a content.
    ///
    /// When multiple index entries disagree about the location, each live
    /// location is tried newest first; the first one whose frame decrypts
    /// and matches the id wins. Tombstoned contents report `NotFound`.
    pub fn get_content(&self, id: &ContentId) -> Result<Vec<u8>, Error> {
        let pending_entry = self.state.lock().unwrap().pending.get(id).cloned();
        let candidates: Vec<IndexEntry> = match pending_entry {
            Some(entry) => vec![entry],
            None => self
                .committed
                .read()
                .unwrap()
                .lookup(id)
                .map(|slot| slot.to_vec())
                .unwrap_or_default(),
        };

        if candidates.is_empty() || candidates[0].deleted {
            return Err(RepoError::NotFound(format!("content {}", id)).into());
        }

        let mut bad_copies = 0;
        for entry in candidates.iter().filter(|entry| !entry.deleted) {
            match self.read_entry(entry) {
                Ok(data) => {
                    if &self.crypt.compute_digest(&data) == id.digest() {
                        if bad_copies > 0 {
                            log::warn!(
                                "content {} had {} undecodable copies, served from '{}'",
                                id,
                                bad_copies,
                                entry.pack
                            );
                        }
                        return Ok(data);
                    }
                    log::warn!("content {} in pack '{}' fails digest check", id, entry.pack);
                    bad_copies += 1;
                }
                Err(err) => {
                    log::warn!(
                        "unable to read content {} from pack '{}': {}",
                        id,
                        entry.pack,
                        err
                    );
                    bad_copies += 1;
                }
            }
        }

        Err(RepoError::Corrupt(format!("content {} corrupt", id)).into())
    }

    fn read_entry(&self, entry: &IndexEntry) -> Result<Vec<u8>, Error> {
        // still sitting in a pending pack buffer?
        let buffered = {
            let state = self.state.lock().unwrap();
            state
                .data_pack
                .read_pending(entry)
                .or_else(|| state.meta_pack.read_pending(entry))
        };

        let raw = match buffered {
            Some(raw) => raw,
            None => {
                match self
                    .store
                    .get(&entry.pack, entry.offset as u64, Some(entry.length as u64))
                {
                    Ok(raw) => raw,
                    Err(err) if is_not_found(&err) => {
                        // the pack may still be in flight on the upload pool
                        self.uploads.wait_idle()?;
                        self.store.get(
                            &entry.pack,
                            entry.offset as u64,
                            Some(entry.length as u64),
                        )?
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        let frame = DataFrame::from_raw(raw)?;
        frame.verify_crc()?;
        frame.decode(Some(&self.crypt))
    }

    /// Tombstone a content. The bytes stay in their pack until
    /// maintenance purges them.
    pub fn delete_content(&self, id: &ContentId) -> Result<(), Error> {
        let entry = self
            .best_entry(id)
            .ok_or_else(|| RepoError::NotFound(format!("content {}", id)))?;
        if entry.deleted {
            return Ok(());
        }

        let tombstone = IndexEntry {
            id: *id,
            pack: entry.pack,
            offset: entry.offset,
            length: entry.length,
            deleted: true,
            timestamp: epoch_nanos_i64(),
        };
        self.state.lock().unwrap().pending.insert(*id, tombstone);
        Ok(())
    }

    /// Shadow a tombstone with a fresh live entry.
    ///
    /// Requires the owning pack to still exist; once maintenance removed
    /// the pack the bytes are gone and undeleting must fail loudly.
    pub fn undelete_content(&self, id: &ContentId) -> Result<(), Error> {
        let entry = self
            .best_entry(id)
            .ok_or_else(|| RepoError::NotFound(format!("content {}", id)))?;
        if !entry.deleted {
            return Ok(());
        }

        self.store.metadata(&entry.pack).map_err(|err| {
            if is_not_found(&err) {
                Error::from(RepoError::NotFound(format!(
                    "pack '{}' for content {} no longer exists - cannot undelete",
                    entry.pack, id
                )))
            } else {
                err
            }
        })?;

        let revived = IndexEntry {
            id: *id,
            pack: entry.pack,
            offset: entry.offset,
            length: entry.length,
            deleted: false,
            timestamp: epoch_nanos_i64(),
        };
        self.state.lock().unwrap().pending.insert(*id, revived);
        Ok(())
    }

    /// Re-store a content's bytes into the current pending pack,
    /// superseding its old location. Used when rewriting underfilled
    /// packs.
    pub fn rewrite_content(&self, id: &ContentId) -> Result<(), Error> {
        let data = self.get_content(id)?;

        let iv = self.crypt.derive_nonce(&nonce_input(id));
        let frame = DataFrame::encode(&data, Some((&self.crypt, iv)), self.options.compression)?;

        let mut state = self.state.lock().unwrap();
        let entry = self.append_locked(&mut state, *id, &frame)?;
        state.pending.insert(*id, entry);
        Ok(())
    }

    /// Visit the authoritative entry of every known content.
    pub fn iterate_contents(
        &self,
        namespace: Option<u8>,
        include_deleted: bool,
        callback: &mut dyn FnMut(&IndexEntry) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let pending: HashMap<ContentId, IndexEntry> =
            self.state.lock().unwrap().pending.clone();

        {
            let committed = self.committed.read().unwrap();
            for entry in committed.iter_best() {
                if pending.contains_key(&entry.id) {
                    continue; // shadowed below
                }
                if !include_deleted && entry.deleted {
                    continue;
                }
                if let Some(ns) = namespace {
                    if entry.id.namespace() != ns {
                        continue;
                    }
                }
                callback(entry)?;
            }
        }

        for entry in pending.values() {
            if !include_deleted && entry.deleted {
                continue;
            }
            if let Some(ns) = namespace {
                if entry.id.namespace() != ns {
                    continue;
                }
            }
            callback(entry)?;
        }

        Ok(())
    }

    /// Number of live contents, optionally restricted to one namespace.
    pub fn live_content_count(&self, namespace: Option<u8>) -> Result<usize, Error> {
        let mut count = 0;
        self.iterate_contents(namespace, false, &mut |_| {
            count += 1;
            Ok(())
        })?;
        Ok(count)
    }

    /// Rebuild the content index from the embedded indexes of all pack
    /// blobs. With `commit` the recovered entries are published as a new
    /// index blob and merged into the in-memory view.
    pub fn recover_indexes(&self, commit: bool) -> Result<usize, Error> {
        let mut recovered = CombinedIndex::new();

        for prefix in [names::DATA_PACK_PREFIX, names::META_PACK_PREFIX] {
            let mut packs = Vec::new();
            self.store.list(prefix, &mut |meta| {
                if names::is_pack_name(&meta.name) {
                    packs.push(meta.name);
                }
                Ok(())
            })?;

            for pack in packs {
                let entries = read_pack_index(self.store.as_ref(), &self.crypt, &pack)
                    .with_context(|| format!("recovering index of pack '{}'", pack))?;
                log::info!("recovered {} entries from pack '{}'", entries.len(), pack);
                recovered.merge_many(entries);
            }
        }

        let count = recovered.live_count();

        if commit {
            let entries = recovered.all_entries();
            if !entries.is_empty() {
                let view = EpochView::scan(self.store.as_ref())?;
                let epoch = view.write_epoch(&self.options.epoch, epoch_i64());
                write_index_blob(self.store.as_ref(), &self.crypt, epoch, &entries)?;
            }
            self.committed.write().unwrap().merge_many(recovered.all_entries());
        }

        Ok(count)
    }

    /// Re-read all index blobs from the backend, replacing the in-memory
    /// view. Pending entries are preserved.
    pub fn refresh(&self) -> Result<(), Error> {
        let reloaded = load_all_indexes(self.store.as_ref(), &self.crypt)?;
        *self.committed.write().unwrap() = reloaded;
        Ok(())
    }

    /// Replace the committed view wholesale. Maintenance uses this after
    /// purging tombstones.
    pub(crate) fn replace_committed(&self, index: CombinedIndex) {
        *self.committed.write().unwrap() = index;
    }

    /// Clone of the committed view's authoritative entries.
    pub(crate) fn committed_snapshot(&self) -> Vec<IndexEntry> {
        self.committed
            .read()
            .unwrap()
            .iter_best()
            .cloned()
            .collect()
    }

    pub fn epoch_options(&self) -> &EpochOptions {
        &self.options.epoch
    }

    /// Aggregate counters over all known contents.
    pub fn content_stats(&self) -> Result<ContentStats, Error> {
        let mut stats = ContentStats::default();
        self.iterate_contents(None, true, &mut |entry| {
            if entry.deleted {
                stats.deleted_count += 1;
            } else if entry.id.is_metadata() {
                stats.metadata_count += 1;
                stats.metadata_bytes += entry.length as u64;
            } else {
                stats.data_count += 1;
                stats.data_bytes += entry.length as u64;
            }
            Ok(())
        })?;
        Ok(stats)
    }
}

/// Counters reported by [`ContentManager::content_stats`]. Bytes are
/// stored (compressed, encrypted) sizes.
#[derive(Clone, Default, Debug)]
pub struct ContentStats {
    pub data_count: u64,
    pub data_bytes: u64,
    pub metadata_count: u64,
    pub metadata_bytes: u64,
    pub deleted_count: u64,
}

#[cfg(test)]
mod test {
    use super::*;
    use silo_api_types::{is_corrupt, NS_MANIFEST};
    use silo_blobstore::{list_blobs, MemoryBlobStore};

    fn manager() -> (Arc<MemoryBlobStore>, ContentManager) {
        let store = Arc::new(MemoryBlobStore::new());
        let crypt = Arc::new(CryptConfig::new([42u8; 32]).unwrap());
        let manager = ContentManager::open(
            Arc::clone(&store) as Arc<dyn BlobStore>,
            crypt,
            ContentOptions::default(),
        )
        .unwrap();
        (store, manager)
    }

    #[test]
    fn write_is_deterministic_and_deduplicates() {
        let (_store, manager) = manager();

        let a = manager.write_content(b"hello world", NS_NONE).unwrap();
        let b = manager.write_content(b"hello world", NS_NONE).unwrap();
        assert_eq!(a, b);
        assert_eq!(manager.get_content(&a).unwrap(), b"hello world");

        manager.flush().unwrap();
        assert_eq!(manager.get_content(&a).unwrap(), b"hello world");
        assert_eq!(manager.live_content_count(None).unwrap(), 1);
    }

    #[test]
    fn zero_length_content_is_valid() {
        let (_store, manager) = manager();
        let id = manager.write_content(b"", NS_NONE).unwrap();
        manager.flush().unwrap();
        assert_eq!(manager.get_content(&id).unwrap(), b"");
    }

    #[test]
    fn namespaces_partition_ids_and_packs() {
        let (store, manager) = manager();

        let plain = manager.write_content(b"payload", NS_NONE).unwrap();
        let manifest = manager.write_content(b"payload", NS_MANIFEST).unwrap();
        assert_ne!(plain, manifest);
        assert_eq!(plain.digest(), manifest.digest());

        manager.flush().unwrap();
        assert_eq!(list_blobs(store.as_ref(), "p").unwrap().len(), 1);
        assert_eq!(list_blobs(store.as_ref(), "q").unwrap().len(), 1);
    }

    #[test]
    fn delete_and_undelete() {
        let (_store, manager) = manager();

        let id = manager.write_content(b"precious", NS_NONE).unwrap();
        manager.flush().unwrap();

        manager.delete_content(&id).unwrap();
        let err = manager.get_content(&id).unwrap_err();
        assert!(is_not_found(&err));

        manager.undelete_content(&id).unwrap();
        assert_eq!(manager.get_content(&id).unwrap(), b"precious");

        // tombstones survive a flush
        manager.delete_content(&id).unwrap();
        manager.flush().unwrap();
        assert!(is_not_found(&manager.get_content(&id).unwrap_err()));
        manager.undelete_content(&id).unwrap();
        manager.flush().unwrap();
        assert_eq!(manager.get_content(&id).unwrap(), b"precious");
    }

    #[test]
    fn undelete_requires_the_pack() {
        let (store, manager) = manager();

        let id = manager.write_content(b"volatile", NS_NONE).unwrap();
        manager.flush().unwrap();
        manager.delete_content(&id).unwrap();
        manager.flush().unwrap();

        // simulate maintenance having removed the pack
        let packs = list_blobs(store.as_ref(), "p").unwrap();
        for pack in packs {
            store.delete(&pack.name).unwrap();
        }

        let err = manager.undelete_content(&id).unwrap_err();
        assert!(is_not_found(&err));
    }

    #[test]
    fn pack_rotation_at_target_size() {
        let store = Arc::new(MemoryBlobStore::new());
        let crypt = Arc::new(CryptConfig::new([1u8; 32]).unwrap());
        let manager = ContentManager::open(
            Arc::clone(&store) as Arc<dyn BlobStore>,
            crypt,
            ContentOptions {
                pack_target_size: 4 * 1024,
                compression: false,
                ..Default::default()
            },
        )
        .unwrap();

        let mut ids = Vec::new();
        for i in 0..8u32 {
            // incompressible-ish distinct contents of 1 KiB
            let mut data = vec![0u8; 1024];
            openssl::rand::rand_bytes(&mut data).unwrap();
            data[0..4].copy_from_slice(&i.to_le_bytes());
            ids.push(manager.write_content(&data, NS_NONE).unwrap());
        }
        manager.flush().unwrap();

        assert!(list_blobs(store.as_ref(), "p").unwrap().len() >= 2);
        for id in ids {
            manager.get_content(&id).unwrap();
        }
        // exactly one index blob per flush
        assert_eq!(list_blobs(store.as_ref(), "x").unwrap().len(), 1);
    }

    #[test]
    fn reopen_sees_flushed_contents() {
        let store = Arc::new(MemoryBlobStore::new());
        let crypt = Arc::new(CryptConfig::new([9u8; 32]).unwrap());

        let id = {
            let manager = ContentManager::open(
                Arc::clone(&store) as Arc<dyn BlobStore>,
                Arc::clone(&crypt),
                ContentOptions::default(),
            )
            .unwrap();
            let id = manager.write_content(b"persisted", NS_NONE).unwrap();
            manager.flush().unwrap();
            id
        };

        let manager = ContentManager::open(
            Arc::clone(&store) as Arc<dyn BlobStore>,
            crypt,
            ContentOptions::default(),
        )
        .unwrap();
        assert_eq!(manager.get_content(&id).unwrap(), b"persisted");
    }

    #[test]
    fn index_recovery_from_pack_trailers() {
        let (store, manager) = manager();

        let id_a = manager.write_content(b"content a", NS_NONE).unwrap();
        let id_b = manager.write_content(b"content b", NS_MANIFEST).unwrap();
        manager.flush().unwrap();
        let before = manager.live_content_count(None).unwrap();

        // lose all index blobs
        for blob in list_blobs(store.as_ref(), "x").unwrap() {
            store.delete(&blob.name).unwrap();
        }
        manager.refresh().unwrap();
        assert_eq!(manager.live_content_count(None).unwrap(), 0);

        let recovered = manager.recover_indexes(true).unwrap();
        assert_eq!(recovered, before);
        assert_eq!(manager.get_content(&id_a).unwrap(), b"content a");
        assert_eq!(manager.get_content(&id_b).unwrap(), b"content b");

        // recovery also persisted a fresh index blob
        manager.refresh().unwrap();
        assert_eq!(manager.live_content_count(None).unwrap(), before);
    }

    #[test]
    fn corrupt_pack_copy_falls_back_or_fails() {
        let (store, manager) = manager();

        let id = manager.write_content(b"important", NS_NONE).unwrap();
        manager.flush().unwrap();

        // corrupt the stored pack frame
        let packs = list_blobs(store.as_ref(), "p").unwrap();
        assert_eq!(packs.len(), 1);
        let entry = manager.best_entry(&id).unwrap();
        let mut data = store.get(&packs[0].name, 0, None).unwrap();
        let victim = (entry.offset + entry.length - 1) as usize;
        data[victim] ^= 0xff;
        store
            .put(&packs[0].name, &data, &PutOptions::default())
            .unwrap();

        let err = manager.get_content(&id).unwrap_err();
        assert!(is_corrupt(&err));
    }
}
