//! The blob storage boundary.
//!
//! A repository lives entirely inside a dumb key/value store of immutable,
//! named byte blobs. Everything above this crate only ever talks to the
//! [`BlobStore`] trait; concrete cloud drivers plug in externally. Shipped
//! here: a filesystem backend, an in-memory backend for tests, and a
//! retrying wrapper implementing the backend timeout/backoff policy.

use anyhow::Error;

mod filesystem;
mod memory;
pub mod names;
mod retry;

pub use filesystem::FilesystemBlobStore;
pub use memory::MemoryBlobStore;
pub use retry::{RetryBlobStore, RetryOptions};

/// Metadata of one stored blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobMeta {
    pub name: String,
    pub size: u64,
    /// Modification time, epoch seconds.
    pub mtime: i64,
}

/// Options for [`BlobStore::put`].
#[derive(Clone, Default, Debug)]
pub struct PutOptions {
    /// Hint that the blob will never be overwritten. Backends with object
    /// lock support may use it; others ignore it.
    pub immutable: bool,
}

/// Opaque store of immutable, named byte blobs.
///
/// Names are ASCII, at most 256 characters. `put` has at-least-once
/// semantics: writing the same name twice with identical data is always
/// legal.
pub trait BlobStore: Send + Sync {
    /// List blobs whose name starts with `prefix`, in unspecified order.
    fn list(
        &self,
        prefix: &str,
        callback: &mut dyn FnMut(BlobMeta) -> Result<(), Error>,
    ) -> Result<(), Error>;

    /// Read `length` bytes at `offset` (or everything from `offset` when
    /// `length` is `None`). Fails with `NotFound` for missing blobs.
    fn get(&self, name: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>, Error>;

    fn put(&self, name: &str, data: &[u8], options: &PutOptions) -> Result<(), Error>;

    /// Delete a blob. Deleting a missing blob fails with `NotFound`.
    fn delete(&self, name: &str) -> Result<(), Error>;

    fn metadata(&self, name: &str) -> Result<BlobMeta, Error>;
}

/// Convenience: collect a listing into a vector.
pub fn list_blobs(store: &dyn BlobStore, prefix: &str) -> Result<Vec<BlobMeta>, Error> {
    let mut blobs = Vec::new();
    store.list(prefix, &mut |meta| {
        blobs.push(meta);
        Ok(())
    })?;
    Ok(blobs)
}

/// Convenience: read a whole blob.
pub fn get_blob(store: &dyn BlobStore, name: &str) -> Result<Vec<u8>, Error> {
    store.get(name, 0, None)
}
