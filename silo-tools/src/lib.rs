//! Infrastructure shared by the silo workspace crates: crypto
//! configuration, worker pools, caches, file helpers.

pub mod cancel;
pub mod crypt_config;
pub mod file_lock;
pub mod fs;
pub mod lru_cache;
pub mod serde_helpers;
pub mod time;
pub mod worker_pool;

pub use cancel::CancelToken;
pub use crypt_config::CryptConfig;
pub use file_lock::{ExclusiveLockGuard, FileLock, SharedLockGuard};
pub use lru_cache::LruCache;
pub use worker_pool::WorkerPool;
