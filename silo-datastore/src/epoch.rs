//! Epoch management for index blobs.
//!
//! Every index blob belongs to one epoch, encoded in its name
//! (`x<epoch>-<random>`). Writers publish into the current epoch; an
//! epoch is treated as closed once nothing was added to it for a quiet
//! period. The compactor merges a closed epoch's blobs into a single
//! one, writing the replacement before deleting the inputs so a crash
//! mid-delete only leaves redundant blobs behind.

use std::collections::BTreeMap;

use anyhow::{Context, Error};

use silo_blobstore::{names, BlobMeta, BlobStore, PutOptions};
use silo_tools::time::epoch_i64;
use silo_tools::{CancelToken, CryptConfig};

use crate::frame::DataFrame;
use crate::index::{decode_index, encode_index, CombinedIndex, IndexEntry};

/// Quiet period after which an epoch no longer accepts new index blobs,
/// seconds.
pub const DEFAULT_EPOCH_CLOSE_AGE: i64 = 20 * 60;

#[derive(Clone, Copy, Debug)]
pub struct EpochOptions {
    pub close_age: i64,
}

impl Default for EpochOptions {
    fn default() -> Self {
        Self {
            close_age: DEFAULT_EPOCH_CLOSE_AGE,
        }
    }
}

/// Snapshot of the index blobs grouped by epoch.
#[derive(Default)]
pub struct EpochView {
    pub blobs_by_epoch: BTreeMap<u32, Vec<BlobMeta>>,
}

impl EpochView {
    /// List the backend and group all index blobs by their epoch.
    pub fn scan(store: &dyn BlobStore) -> Result<Self, Error> {
        let mut view = Self::default();
        store.list(names::INDEX_PREFIX, &mut |meta| {
            if let Some(epoch) = names::parse_index_epoch(&meta.name) {
                view.blobs_by_epoch.entry(epoch).or_default().push(meta);
            } else {
                log::warn!("ignoring stray blob '{}' in index prefix", meta.name);
            }
            Ok(())
        })?;
        Ok(view)
    }

    pub fn latest_epoch(&self) -> u32 {
        self.blobs_by_epoch.keys().next_back().copied().unwrap_or(0)
    }

    /// The epoch a writer should publish into at `now`: the latest one,
    /// or the next if the latest saw no writes for the close age.
    pub fn write_epoch(&self, options: &EpochOptions, now: i64) -> u32 {
        let latest = self.latest_epoch();
        match self.blobs_by_epoch.get(&latest) {
            None => latest,
            Some(blobs) => {
                let youngest = blobs.iter().map(|meta| meta.mtime).max().unwrap_or(now);
                if now - youngest >= options.close_age {
                    latest + 1
                } else {
                    latest
                }
            }
        }
    }

    /// Epochs no writer may publish into anymore.
    pub fn closed_epochs(&self, options: &EpochOptions, now: i64) -> Vec<u32> {
        let write_epoch = self.write_epoch(options, now);
        self.blobs_by_epoch
            .keys()
            .copied()
            .filter(|epoch| *epoch < write_epoch)
            .collect()
    }

    pub fn all_blobs(&self) -> impl Iterator<Item = &BlobMeta> {
        self.blobs_by_epoch.values().flatten()
    }
}

/// Read and merge one index blob into the combined index.
pub fn load_index_blob(
    store: &dyn BlobStore,
    crypt: &CryptConfig,
    name: &str,
    index: &mut CombinedIndex,
) -> Result<(), Error> {
    let raw = store.get(name, 0, None)?;
    let frame = DataFrame::from_raw(raw).with_context(|| format!("index blob '{}'", name))?;
    frame.verify_crc()?;
    let payload = frame
        .decode(Some(crypt))
        .with_context(|| format!("index blob '{}'", name))?;
    index.merge_many(decode_index(&payload)?);
    Ok(())
}

/// Load the merged view over every index blob in the repository.
pub fn load_all_indexes(store: &dyn BlobStore, crypt: &CryptConfig) -> Result<CombinedIndex, Error> {
    let view = EpochView::scan(store)?;
    let mut index = CombinedIndex::new();
    for meta in view.all_blobs() {
        load_index_blob(store, crypt, &meta.name, &mut index)?;
    }
    Ok(index)
}

/// Write an index blob containing `entries` into `epoch`.
pub fn write_index_blob(
    store: &dyn BlobStore,
    crypt: &CryptConfig,
    epoch: u32,
    entries: &[IndexEntry],
) -> Result<String, Error> {
    let payload = encode_index(entries);
    let mut iv = [0u8; 16];
    openssl::rand::rand_bytes(&mut iv)?;
    let frame = DataFrame::encode(&payload, Some((crypt, iv)), true)?;

    let name = names::new_index_name(epoch);
    store.put(&name, frame.raw(), &PutOptions::default())?;
    Ok(name)
}

/// Merge all index blobs of one closed epoch into a single replacement
/// blob, then delete inputs older than `safety_age` seconds.
///
/// Idempotent: re-running after a crash merely re-merges; readers always
/// take the union.
pub fn compact_epoch(
    store: &dyn BlobStore,
    crypt: &CryptConfig,
    view: &EpochView,
    epoch: u32,
    safety_age: i64,
    cancel: &CancelToken,
) -> Result<u64, Error> {
    let blobs = match view.blobs_by_epoch.get(&epoch) {
        Some(blobs) if blobs.len() > 1 => blobs,
        _ => return Ok(0),
    };

    let mut merged = CombinedIndex::new();
    for meta in blobs {
        cancel.check()?;
        load_index_blob(store, crypt, &meta.name, &mut merged)?;
    }

    let replacement = write_index_blob(store, crypt, epoch, &merged.all_entries())?;
    log::info!(
        "compacted {} index blobs of epoch {} into '{}'",
        blobs.len(),
        epoch,
        replacement
    );

    let now = epoch_i64();
    let mut deleted = 0;
    for meta in blobs {
        cancel.check()?;
        if now - meta.mtime < safety_age {
            continue; // a reader may still be using it, next run gets it
        }
        match store.delete(&meta.name) {
            Ok(()) => deleted += 1,
            Err(err) if silo_api_types::is_not_found(&err) => (),
            Err(err) => return Err(err),
        }
    }

    Ok(deleted)
}
