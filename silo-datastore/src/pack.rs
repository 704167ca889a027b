//! Pack blobs: concatenated content frames plus an embedded index.
//!
//! A pack is immutable once uploaded. Its layout:
//!
//! ```text
//! [format recovery copy]   only on the first data pack of a new repo
//! frame | frame | ...      independently encrypted contents
//! trailer frame            encrypted pack index (entry table)
//! u32 trailer length
//! 8 byte trailer magic
//! ```
//!
//! The embedded index makes every pack self-describing, so the global
//! index blobs can be rebuilt from packs alone (`recover_indexes`).

use anyhow::{Context, Error};

use silo_api_types::{ContentId, RepoError};
use silo_blobstore::{names, BlobStore};
use silo_tools::time::epoch_nanos_i64;
use silo_tools::CryptConfig;

use crate::file_formats::{FORMAT_COPY_MAGIC_1_0, PACK_TRAILER_MAGIC_1_0};
use crate::frame::DataFrame;
use crate::index::{decode_index, encode_index, IndexEntry};

/// Default pack target size.
pub const DEFAULT_PACK_TARGET_SIZE: usize = 20 * 1024 * 1024;

/// Pending pack buffer. Contents append until the builder is rotated
/// out, finished and uploaded.
pub struct PackBuilder {
    name: String,
    metadata: bool,
    buf: Vec<u8>,
    entries: Vec<IndexEntry>,
}

impl PackBuilder {
    pub fn new(metadata: bool) -> Self {
        Self {
            name: names::new_pack_name(metadata),
            metadata,
            buf: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Prepend a format blob recovery copy. Only valid on a fresh
    /// builder.
    pub fn set_format_prelude(&mut self, format_bytes: &[u8]) {
        assert!(self.buf.is_empty(), "prelude on non-empty pack");
        self.buf.extend_from_slice(&FORMAT_COPY_MAGIC_1_0);
        self.buf
            .extend_from_slice(&(format_bytes.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(format_bytes);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_metadata(&self) -> bool {
        self.metadata
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Append one content frame, returning its index entry.
    pub fn append(&mut self, id: ContentId, frame: &DataFrame) -> IndexEntry {
        let offset = self.buf.len() as u32;
        self.buf.extend_from_slice(frame.raw());

        let entry = IndexEntry {
            id,
            pack: self.name.clone(),
            offset,
            length: frame.raw().len() as u32,
            deleted: false,
            timestamp: epoch_nanos_i64(),
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Serve a read for a content still sitting in this pending pack.
    pub fn read_pending(&self, entry: &IndexEntry) -> Option<Vec<u8>> {
        if entry.pack != self.name {
            return None;
        }
        let start = entry.offset as usize;
        let end = start + entry.length as usize;
        self.buf.get(start..end).map(|slice| slice.to_vec())
    }

    /// Close the pack: append the embedded index trailer and hand out
    /// name, bytes and the entries for the global index.
    pub fn finish(self, crypt: &CryptConfig) -> Result<FinishedPack, Error> {
        let mut buf = self.buf;

        let payload = encode_index(&self.entries);
        let mut iv = [0u8; 16];
        openssl::rand::rand_bytes(&mut iv)?;
        let trailer = DataFrame::encode(&payload, Some((crypt, iv)), true)?;

        buf.extend_from_slice(trailer.raw());
        buf.extend_from_slice(&(trailer.raw().len() as u32).to_le_bytes());
        buf.extend_from_slice(&PACK_TRAILER_MAGIC_1_0);

        Ok(FinishedPack {
            name: self.name,
            data: buf,
            entries: self.entries,
        })
    }
}

pub struct FinishedPack {
    pub name: String,
    pub data: Vec<u8>,
    pub entries: Vec<IndexEntry>,
}

/// Read the embedded index of an uploaded pack.
pub fn read_pack_index(
    store: &dyn BlobStore,
    crypt: &CryptConfig,
    name: &str,
) -> Result<Vec<IndexEntry>, Error> {
    let meta = store.metadata(name)?;
    if meta.size < 12 {
        return Err(RepoError::Corrupt(format!("pack '{}' too small", name)).into());
    }

    let tail = store.get(name, meta.size - 12, Some(12))?;
    if tail[4..12] != PACK_TRAILER_MAGIC_1_0 {
        return Err(RepoError::Corrupt(format!("pack '{}' has no trailer", name)).into());
    }
    let trailer_len = u32::from_le_bytes(tail[0..4].try_into().unwrap()) as u64;
    if trailer_len + 12 > meta.size {
        return Err(RepoError::Corrupt(format!("pack '{}' trailer length invalid", name)).into());
    }

    let raw = store.get(name, meta.size - 12 - trailer_len, Some(trailer_len))?;
    let frame = DataFrame::from_raw(raw).with_context(|| format!("pack '{}' trailer", name))?;
    frame.verify_crc()?;
    let payload = frame
        .decode(Some(crypt))
        .with_context(|| format!("pack '{}' trailer", name))?;
    decode_index(&payload)
}

/// Try to read a format blob recovery copy from the head of a pack.
pub fn read_format_prelude(store: &dyn BlobStore, name: &str) -> Result<Option<Vec<u8>>, Error> {
    let meta = store.metadata(name)?;
    if meta.size < 12 {
        return Ok(None);
    }
    let head = store.get(name, 0, Some(12))?;
    if head[0..8] != FORMAT_COPY_MAGIC_1_0 {
        return Ok(None);
    }
    let len = u32::from_le_bytes(head[8..12].try_into().unwrap()) as u64;
    if len + 12 > meta.size {
        return Err(RepoError::Corrupt(format!("pack '{}' format copy truncated", name)).into());
    }
    Ok(Some(store.get(name, 12, Some(len))?))
}
