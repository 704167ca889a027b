//! Content index: maps content ids to their pack location.
//!
//! Index blobs (`x<epoch>-<random>`) hold a sorted entry table plus a
//! pack-name table; the whole payload travels inside one encrypted
//! frame. Readers merge the union of all index blobs: for one id the
//! newest entry wins, with ties resolving to the tombstone. Entries that
//! disagree about a live content's location are all retained so reads
//! can fall back to a copy that still decodes.

use std::collections::BTreeMap;

use anyhow::{bail, Error};

use silo_api_types::{ContentId, RepoError, CONTENT_DIGEST_SIZE};

use crate::file_formats::INDEX_BLOB_MAGIC_1_0;

pub const INDEX_FORMAT_VERSION: u32 = 1;

const ENTRY_SIZE: usize = 1 + CONTENT_DIGEST_SIZE + 4 + 4 + 4 + 1 + 8;

const FLAG_DELETED: u8 = 1;

/// One index entry: where a content lives, or its tombstone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: ContentId,
    /// Pack blob name. Tombstones keep the location of the entry they
    /// shadow.
    pub pack: String,
    pub offset: u32,
    /// Stored frame length within the pack.
    pub length: u32,
    pub deleted: bool,
    /// Write time, epoch nanoseconds. Orders entries for the same id.
    pub timestamp: i64,
}

impl IndexEntry {
    pub fn timestamp_secs(&self) -> i64 {
        self.timestamp / 1_000_000_000
    }

    /// Ordering rank: newer wins, tombstones win ties.
    fn rank(&self) -> (i64, bool) {
        (self.timestamp, self.deleted)
    }
}

/// Serialize entries into an index blob payload (without the surrounding
/// encrypted frame).
pub fn encode_index(entries: &[IndexEntry]) -> Vec<u8> {
    let mut sorted: Vec<&IndexEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.id.cmp(&b.id).then(a.rank().cmp(&b.rank())));

    // pack name table
    let mut pack_ids = BTreeMap::new();
    for entry in &sorted {
        let next = pack_ids.len() as u32;
        pack_ids.entry(entry.pack.as_str()).or_insert(next);
    }
    let mut packs: Vec<&str> = pack_ids.keys().copied().collect();
    packs.sort_by_key(|name| pack_ids[name]);

    let mut data = Vec::with_capacity(32 + packs.len() * 20 + sorted.len() * ENTRY_SIZE);
    data.extend_from_slice(&INDEX_BLOB_MAGIC_1_0);
    data.extend_from_slice(&INDEX_FORMAT_VERSION.to_le_bytes());
    data.extend_from_slice(&(packs.len() as u32).to_le_bytes());
    data.extend_from_slice(&(sorted.len() as u64).to_le_bytes());

    for pack in &packs {
        let bytes = pack.as_bytes();
        data.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        data.extend_from_slice(bytes);
    }

    for entry in sorted {
        data.push(entry.id.namespace());
        data.extend_from_slice(entry.id.digest());
        data.extend_from_slice(&pack_ids[entry.pack.as_str()].to_le_bytes());
        data.extend_from_slice(&entry.offset.to_le_bytes());
        data.extend_from_slice(&entry.length.to_le_bytes());
        data.push(if entry.deleted { FLAG_DELETED } else { 0 });
        data.extend_from_slice(&entry.timestamp.to_le_bytes());
    }

    data
}

fn corrupt(msg: &str) -> Error {
    RepoError::Corrupt(format!("index blob: {}", msg)).into()
}

/// Parse an index blob payload.
pub fn decode_index(data: &[u8]) -> Result<Vec<IndexEntry>, Error> {
    let mut cursor = 0usize;

    let take = |cursor: &mut usize, len: usize| -> Result<&[u8], Error> {
        let start = *cursor;
        let end = start.checked_add(len).ok_or_else(|| corrupt("overflow"))?;
        if end > data.len() {
            return Err(corrupt("truncated"));
        }
        *cursor = end;
        Ok(&data[start..end])
    };

    if take(&mut cursor, 8)? != INDEX_BLOB_MAGIC_1_0 {
        return Err(corrupt("bad magic"));
    }
    let version = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap());
    if version != INDEX_FORMAT_VERSION {
        return Err(corrupt("unsupported version"));
    }
    let pack_count = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap()) as usize;
    let entry_count = u64::from_le_bytes(take(&mut cursor, 8)?.try_into().unwrap()) as usize;

    let mut packs = Vec::with_capacity(pack_count);
    for _ in 0..pack_count {
        let len = u16::from_le_bytes(take(&mut cursor, 2)?.try_into().unwrap()) as usize;
        let name = std::str::from_utf8(take(&mut cursor, len)?)
            .map_err(|_| corrupt("pack name not utf-8"))?;
        packs.push(name.to_string());
    }

    let mut entries = Vec::with_capacity(entry_count);
    for _ in 0..entry_count {
        let namespace = take(&mut cursor, 1)?[0];
        let digest: [u8; CONTENT_DIGEST_SIZE] =
            take(&mut cursor, CONTENT_DIGEST_SIZE)?.try_into().unwrap();
        let pack_idx = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap()) as usize;
        let offset = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap());
        let length = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().unwrap());
        let flags = take(&mut cursor, 1)?[0];
        let timestamp = i64::from_le_bytes(take(&mut cursor, 8)?.try_into().unwrap());

        let pack = packs
            .get(pack_idx)
            .ok_or_else(|| corrupt("pack index out of range"))?
            .clone();

        entries.push(IndexEntry {
            id: ContentId::new(namespace, digest),
            pack,
            offset,
            length,
            deleted: flags & FLAG_DELETED != 0,
            timestamp,
        });
    }

    if cursor != data.len() {
        return Err(corrupt("trailing bytes"));
    }

    Ok(entries)
}

/// The merged view over any number of index blobs.
///
/// Per id the entries are kept newest first, deduplicated by
/// `(pack, offset, deleted)`. Merging is commutative and idempotent.
#[derive(Default)]
pub struct CombinedIndex {
    entries: BTreeMap<ContentId, Vec<IndexEntry>>,
}

impl CombinedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge_entry(&mut self, entry: IndexEntry) {
        let slot = self.entries.entry(entry.id).or_default();

        if slot
            .iter()
            .any(|existing| {
                existing.pack == entry.pack
                    && existing.offset == entry.offset
                    && existing.deleted == entry.deleted
                    && existing.timestamp == entry.timestamp
            })
        {
            return;
        }

        let rank = entry.rank();
        let pos = slot
            .iter()
            .position(|existing| existing.rank() < rank)
            .unwrap_or(slot.len());
        slot.insert(pos, entry);
    }

    pub fn merge_many<I: IntoIterator<Item = IndexEntry>>(&mut self, entries: I) {
        for entry in entries {
            self.merge_entry(entry);
        }
    }

    /// All retained entries for an id, newest first.
    pub fn lookup(&self, id: &ContentId) -> Option<&[IndexEntry]> {
        self.entries.get(id).map(|slot| slot.as_slice())
    }

    /// The authoritative entry for an id (newest; tombstone on ties).
    pub fn best(&self, id: &ContentId) -> Option<&IndexEntry> {
        self.entries.get(id).and_then(|slot| slot.first())
    }

    /// Whether the id currently resolves to stored bytes.
    pub fn is_live(&self, id: &ContentId) -> bool {
        matches!(self.best(id), Some(entry) if !entry.deleted)
    }

    /// Iterate over the authoritative entry of every known id, including
    /// tombstones.
    pub fn iter_best(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values().filter_map(|slot| slot.first())
    }

    /// Number of live contents.
    pub fn live_count(&self) -> usize {
        self.iter_best().filter(|entry| !entry.deleted).count()
    }

    /// Drop every entry of the given id. Used when purging tombstones.
    pub fn forget(&mut self, id: &ContentId) {
        self.entries.remove(id);
    }

    /// Flatten into a list of entries (authoritative entries plus any
    /// retained alternates), suitable for writing a compacted index.
    pub fn all_entries(&self) -> Vec<IndexEntry> {
        self.entries.values().flatten().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(digest: u8, ts: i64, deleted: bool) -> IndexEntry {
        IndexEntry {
            id: ContentId::plain([digest; 32]),
            pack: format!("p{:016x}", digest),
            offset: 12,
            length: 100,
            deleted,
            timestamp: ts,
        }
    }

    #[test]
    fn codec_roundtrip() {
        let entries = vec![entry(3, 30, false), entry(1, 10, false), entry(2, 20, true)];
        let data = encode_index(&entries);
        let mut decoded = decode_index(&data).unwrap();

        // decoded entries come back sorted by id
        assert_eq!(decoded.len(), 3);
        decoded.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        assert_eq!(decoded, {
            let mut sorted = entries.clone();
            sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
            sorted
        });
    }

    #[test]
    fn codec_rejects_corruption() {
        let data = encode_index(&[entry(1, 1, false)]);
        assert!(decode_index(&data[..data.len() - 1]).is_err());
        let mut bad_magic = data.clone();
        bad_magic[0] ^= 0xff;
        assert!(decode_index(&bad_magic).is_err());
    }

    #[test]
    fn merge_is_idempotent_and_commutative() {
        let blob_a = vec![entry(1, 10, false), entry(2, 20, false)];
        let blob_b = vec![entry(1, 15, true), entry(3, 5, false)];

        let mut forward = CombinedIndex::new();
        forward.merge_many(blob_a.clone());
        forward.merge_many(blob_b.clone());
        // applying the same blob twice has no effect
        forward.merge_many(blob_a.clone());

        let mut backward = CombinedIndex::new();
        backward.merge_many(blob_b);
        backward.merge_many(blob_a);

        assert_eq!(forward.all_entries(), backward.all_entries());
        assert!(!forward.is_live(&ContentId::plain([1; 32])));
        assert!(forward.is_live(&ContentId::plain([2; 32])));
    }

    #[test]
    fn newest_wins_and_tombstone_wins_ties() {
        let mut index = CombinedIndex::new();
        let id = ContentId::plain([9; 32]);

        index.merge_entry(IndexEntry {
            id,
            pack: "p0000000000000001".into(),
            offset: 0,
            length: 10,
            deleted: false,
            timestamp: 100,
        });
        assert!(index.is_live(&id));

        // tombstone at the same timestamp shadows the write
        index.merge_entry(IndexEntry {
            id,
            pack: "p0000000000000001".into(),
            offset: 0,
            length: 10,
            deleted: true,
            timestamp: 100,
        });
        assert!(!index.is_live(&id));

        // a newer write (undelete) shadows the tombstone
        index.merge_entry(IndexEntry {
            id,
            pack: "p0000000000000001".into(),
            offset: 0,
            length: 10,
            deleted: false,
            timestamp: 101,
        });
        assert!(index.is_live(&id));
    }

    #[test]
    fn conflicting_locations_are_retained() {
        let mut index = CombinedIndex::new();
        let id = ContentId::plain([4; 32]);

        index.merge_entry(IndexEntry {
            id,
            pack: "p000000000000000a".into(),
            offset: 0,
            length: 10,
            deleted: false,
            timestamp: 50,
        });
        index.merge_entry(IndexEntry {
            id,
            pack: "p000000000000000b".into(),
            offset: 64,
            length: 10,
            deleted: false,
            timestamp: 60,
        });

        let slot = index.lookup(&id).unwrap();
        assert_eq!(slot.len(), 2);
        // newest first
        assert_eq!(slot[0].pack, "p000000000000000b");
        assert_eq!(slot[1].pack, "p000000000000000a");
    }
}
