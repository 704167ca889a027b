//! Local on-disk cache for fetched blobs.
//!
//! The cache directory is shared between processes: a flock'd lock file
//! guards the sweeper against readers, a marker file identifies the
//! directory so the
//! snapshot engine never backs the cache up into itself. Eviction is
//! LRU by access time, capped by a byte budget.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use anyhow::{format_err, Context, Error};

use silo_blobstore::{names, BlobMeta, BlobStore, PutOptions};
use silo_tools::fs::{ensure_dir, replace_file};
use silo_tools::FileLock;

/// Marker file identifying a cache directory.
pub const CACHE_MARKER_NAME: &str = ".silo-cache";

const MARKER_CONTENT: &[u8] =
    b"This directory is a silo cache. Its contents are expendable and must not be backed up.\n";

/// Does `path` (or any ancestor) carry the cache marker?
pub fn is_inside_cache_dir(path: &Path) -> bool {
    let mut current = Some(path);
    while let Some(dir) = current {
        if dir.join(CACHE_MARKER_NAME).is_file() {
            return true;
        }
        current = dir.parent();
    }
    false
}

pub struct LocalCache {
    root: PathBuf,
    lock: FileLock,
    budget_bytes: u64,
}

impl LocalCache {
    pub fn open<P: Into<PathBuf>>(root: P, budget_bytes: u64) -> Result<Self, Error> {
        let root = root.into();
        ensure_dir(&root)?;

        let marker = root.join(CACHE_MARKER_NAME);
        if !marker.is_file() {
            replace_file(&marker, MARKER_CONTENT, false)?;
        }

        let lock = FileLock::open(root.join(".lock"))?;

        Ok(Self {
            root,
            lock,
            budget_bytes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = openssl::sha::sha256(key.as_bytes());
        let hex = hex::encode(digest);
        self.root.join(&hex[0..2]).join(&hex)
    }

    /// Fetch a cached value, updating its access time.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let _guard = self.lock.try_shared().ok()?;

        let path = self.entry_path(key);
        let data = std::fs::read(&path).ok()?;
        touch_atime(&path);
        Some(data)
    }

    /// Insert a value. Failures are logged, never fatal - the cache is
    /// expendable.
    pub fn put(&self, key: &str, data: &[u8]) {
        let guard = self.lock.try_shared();
        if guard.is_err() {
            return;
        }

        let path = self.entry_path(key);
        let result = (|| -> Result<(), Error> {
            if let Some(parent) = path.parent() {
                ensure_dir(parent)?;
            }
            replace_file(&path, data, false)
        })();

        if let Err(err) = result {
            log::warn!("cache write for '{}' failed: {}", key, err);
        }
    }

    pub fn remove(&self, key: &str) {
        let _ = std::fs::remove_file(self.entry_path(key));
    }

    /// Evict least recently used entries until the cache fits its byte
    /// budget. Returns the number of bytes evicted.
    pub fn sweep(&self) -> Result<u64, Error> {
        let _guard = self
            .lock
            .try_exclusive()
            .map_err(|err| format_err!("cache busy - {}", err))?;

        let mut entries: Vec<(i64, u64, PathBuf)> = Vec::new();
        let mut total: u64 = 0;

        for shard in std::fs::read_dir(&self.root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for file in std::fs::read_dir(shard.path())? {
                let file = file?;
                let metadata = file.metadata()?;
                if !metadata.is_file() {
                    continue;
                }
                let atime = metadata
                    .accessed()
                    .ok()
                    .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                    .map(|duration| duration.as_secs() as i64)
                    .unwrap_or(0);
                total += metadata.len();
                entries.push((atime, metadata.len(), file.path()));
            }
        }

        if total <= self.budget_bytes {
            return Ok(0);
        }

        entries.sort_by_key(|(atime, _, _)| *atime);

        let mut evicted = 0u64;
        for (_, size, path) in entries {
            if total - evicted <= self.budget_bytes {
                break;
            }
            if std::fs::remove_file(&path).is_ok() {
                evicted += size;
            }
        }

        log::debug!("cache sweep evicted {} bytes", evicted);
        Ok(evicted)
    }
}

/// Update only the access time, keeping mtime untouched.
fn touch_atime(path: &Path) {
    const UTIME_NOW: i64 = (1 << 30) - 1;
    const UTIME_OMIT: i64 = (1 << 30) - 2;

    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(_) => return,
    };

    let times: [libc::timespec; 2] = [
        libc::timespec {
            tv_sec: 0,
            tv_nsec: UTIME_NOW,
        },
        libc::timespec {
            tv_sec: 0,
            tv_nsec: UTIME_OMIT,
        },
    ];

    unsafe {
        libc::futimens(file.as_raw_fd(), &times[0]);
    }
}

/// Blob store wrapper caching immutable metadata reads (index blobs and
/// metadata pack ranges) in a [`LocalCache`].
pub struct CachingBlobStore {
    inner: Arc<dyn BlobStore>,
    cache: Arc<LocalCache>,
}

impl CachingBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>, cache: Arc<LocalCache>) -> Self {
        Self { inner, cache }
    }

    fn cacheable(name: &str) -> bool {
        name.starts_with(names::INDEX_PREFIX) || name.starts_with(names::META_PACK_PREFIX)
    }
}

impl BlobStore for CachingBlobStore {
    fn list(
        &self,
        prefix: &str,
        callback: &mut dyn FnMut(BlobMeta) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.inner.list(prefix, callback)
    }

    fn get(&self, name: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>, Error> {
        if !Self::cacheable(name) {
            return self.inner.get(name, offset, length);
        }

        let key = match length {
            Some(length) => format!("{}@{}+{}", name, offset, length),
            None => format!("{}@{}", name, offset),
        };

        if let Some(data) = self.cache.get(&key) {
            return Ok(data);
        }

        let data = self
            .inner
            .get(name, offset, length)
            .with_context(|| format!("fetching blob '{}'", name))?;
        self.cache.put(&key, &data);
        Ok(data)
    }

    fn put(&self, name: &str, data: &[u8], options: &PutOptions) -> Result<(), Error> {
        self.inner.put(name, data, options)
    }

    fn delete(&self, name: &str) -> Result<(), Error> {
        if Self::cacheable(name) {
            // whole-blob reads are the common cached shape
            self.cache.remove(&format!("{}@0", name));
        }
        self.inner.delete(name)
    }

    fn metadata(&self, name: &str) -> Result<BlobMeta, Error> {
        self.inner.metadata(name)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use silo_blobstore::MemoryBlobStore;

    #[test]
    fn marker_detection() {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = dir.path().join("cache");
        let _cache = LocalCache::open(&cache_root, 1024 * 1024).unwrap();

        assert!(is_inside_cache_dir(&cache_root));
        assert!(is_inside_cache_dir(&cache_root.join("deep/nested")));
        assert!(!is_inside_cache_dir(dir.path()));
    }

    #[test]
    fn cache_roundtrip_and_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::open(dir.path().join("cache"), 2048).unwrap();

        assert!(cache.get("missing").is_none());

        cache.put("a", &[1u8; 1024]);
        cache.put("b", &[2u8; 1024]);
        assert_eq!(cache.get("a").unwrap(), vec![1u8; 1024]);

        // within budget, nothing evicted
        assert_eq!(cache.sweep().unwrap(), 0);

        cache.put("c", &[3u8; 1024]);
        let evicted = cache.sweep().unwrap();
        assert!(evicted >= 1024);
    }

    #[test]
    fn caching_store_serves_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(LocalCache::open(dir.path().join("cache"), 1 << 20).unwrap());
        let backend = Arc::new(MemoryBlobStore::new());

        let store = CachingBlobStore::new(
            Arc::clone(&backend) as Arc<dyn BlobStore>,
            Arc::clone(&cache),
        );

        let name = "x00000000-0123456789abcdef";
        store.put(name, b"index data", &PutOptions::default()).unwrap();
        assert_eq!(store.get(name, 0, None).unwrap(), b"index data");

        // second read is served even if the backend loses the blob
        backend.delete(name).unwrap();
        assert_eq!(store.get(name, 0, None).unwrap(), b"index data");

        // data packs bypass the cache
        store
            .put("p0123456789abcdef", b"pack", &PutOptions::default())
            .unwrap();
        store.get("p0123456789abcdef", 0, None).unwrap();
        backend.delete("p0123456789abcdef").unwrap();
        assert!(store.get("p0123456789abcdef", 0, None).is_err());
    }
}
