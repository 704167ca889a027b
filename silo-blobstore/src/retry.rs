//! Retrying blob store wrapper.
//!
//! Transient backend failures retry with exponential backoff plus jitter
//! until a deadline; permanent failures (missing blobs, invalid names,
//! authentication) fail fast.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Error;

use silo_api_types::RepoError;

use crate::{BlobMeta, BlobStore, PutOptions};

#[derive(Clone, Debug)]
pub struct RetryOptions {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Overall deadline per operation, including all retries.
    pub deadline: Duration,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            deadline: Duration::from_secs(120),
        }
    }
}

pub struct RetryBlobStore {
    inner: Arc<dyn BlobStore>,
    options: RetryOptions,
}

fn is_transient(err: &Error) -> bool {
    if matches!(
        err.downcast_ref::<RepoError>(),
        Some(RepoError::Retryable { .. })
    ) {
        return true;
    }
    if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
        return matches!(
            io_err.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock
        );
    }
    false
}

fn jitter(delay: Duration) -> Duration {
    let mut byte = [0u8; 1];
    if openssl::rand::rand_bytes(&mut byte).is_err() {
        return delay;
    }
    // up to +50%
    delay + delay.mul_f64(byte[0] as f64 / 512.0)
}

impl RetryBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>, options: RetryOptions) -> Self {
        Self { inner, options }
    }

    pub fn inner(&self) -> &Arc<dyn BlobStore> {
        &self.inner
    }

    fn run<T>(
        &self,
        what: &str,
        mut op: impl FnMut(&dyn BlobStore) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let start = Instant::now();
        let mut delay = self.options.initial_delay;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match op(self.inner.as_ref()) {
                Ok(value) => return Ok(value),
                Err(err) if !is_transient(&err) => return Err(err),
                Err(err) => {
                    if start.elapsed() + delay > self.options.deadline {
                        log::warn!("giving up on {} after {} attempts: {}", what, attempts, err);
                        return Err(Error::from(RepoError::Retryable {
                            attempts,
                            message: err.to_string(),
                        }));
                    }
                    log::debug!("retrying {} (attempt {}): {}", what, attempts, err);
                    std::thread::sleep(jitter(delay));
                    delay = (delay * 2).min(self.options.max_delay);
                }
            }
        }
    }
}

impl BlobStore for RetryBlobStore {
    fn list(
        &self,
        prefix: &str,
        callback: &mut dyn FnMut(BlobMeta) -> Result<(), Error>,
    ) -> Result<(), Error> {
        // listing restarts from scratch on retry, so collect first and
        // only feed the callback from a successful pass
        let blobs = self.run("list", |store| crate::list_blobs(store, prefix))?;
        for meta in blobs {
            callback(meta)?;
        }
        Ok(())
    }

    fn get(&self, name: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>, Error> {
        self.run("get", |store| store.get(name, offset, length))
    }

    fn put(&self, name: &str, data: &[u8], options: &PutOptions) -> Result<(), Error> {
        self.run("put", |store| store.put(name, data, options))
    }

    fn delete(&self, name: &str) -> Result<(), Error> {
        self.run("delete", |store| store.delete(name))
    }

    fn metadata(&self, name: &str) -> Result<BlobMeta, Error> {
        self.run("metadata", |store| store.metadata(name))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::MemoryBlobStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails every operation with a transient error `failures` times
    /// before delegating.
    struct FlakyStore {
        inner: MemoryBlobStore,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn trip(&self) -> Result<(), Error> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            }).is_ok()
            {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "simulated timeout",
                )
                .into());
            }
            Ok(())
        }
    }

    impl BlobStore for FlakyStore {
        fn list(
            &self,
            prefix: &str,
            callback: &mut dyn FnMut(BlobMeta) -> Result<(), Error>,
        ) -> Result<(), Error> {
            self.trip()?;
            self.inner.list(prefix, callback)
        }
        fn get(&self, name: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>, Error> {
            self.trip()?;
            self.inner.get(name, offset, length)
        }
        fn put(&self, name: &str, data: &[u8], options: &PutOptions) -> Result<(), Error> {
            self.trip()?;
            self.inner.put(name, data, options)
        }
        fn delete(&self, name: &str) -> Result<(), Error> {
            self.trip()?;
            self.inner.delete(name)
        }
        fn metadata(&self, name: &str) -> Result<BlobMeta, Error> {
            self.trip()?;
            self.inner.metadata(name)
        }
    }

    fn retry_store(failures: u32) -> RetryBlobStore {
        let flaky = FlakyStore {
            inner: MemoryBlobStore::new(),
            failures: AtomicU32::new(failures),
        };
        RetryBlobStore::new(
            Arc::new(flaky),
            RetryOptions {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                deadline: Duration::from_millis(200),
            },
        )
    }

    #[test]
    fn transient_errors_are_retried() {
        let store = retry_store(2);
        store
            .put("p0000000000000000", b"data", &PutOptions::default())
            .unwrap();
        assert_eq!(store.get("p0000000000000000", 0, None).unwrap(), b"data");
    }

    #[test]
    fn permanent_errors_fail_fast() {
        let store = retry_store(0);
        let err = store.get("p0000000000000000", 0, None).unwrap_err();
        assert!(silo_api_types::is_not_found(&err));
    }

    #[test]
    fn deadline_surfaces_retryable() {
        let store = retry_store(u32::MAX);
        let err = store.get("p0000000000000000", 0, None).unwrap_err();
        match err.downcast_ref::<RepoError>() {
            Some(RepoError::Retryable { attempts, .. }) => assert!(*attempts > 1),
            other => panic!("unexpected error kind: {:?}", other),
        }
    }
}
