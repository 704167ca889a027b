//! In-memory blob store used by unit and integration tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{bail, Error};

use silo_api_types::RepoError;
use silo_tools::time::epoch_i64;

use crate::names::check_blob_name;
use crate::{BlobMeta, BlobStore, PutOptions};

#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, (i64, Vec<u8>)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn blob_count(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    /// Backdate a blob's mtime, for tests exercising safety windows.
    pub fn age_blob(&self, name: &str, seconds: i64) -> Result<(), Error> {
        let mut blobs = self.blobs.lock().unwrap();
        match blobs.get_mut(name) {
            Some((mtime, _)) => {
                *mtime -= seconds;
                Ok(())
            }
            None => Err(RepoError::NotFound(format!("blob '{}'", name)).into()),
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn list(
        &self,
        prefix: &str,
        callback: &mut dyn FnMut(BlobMeta) -> Result<(), Error>,
    ) -> Result<(), Error> {
        // clone the matching range so the callback may re-enter the store
        let matches: Vec<BlobMeta> = {
            let blobs = self.blobs.lock().unwrap();
            blobs
                .range(prefix.to_string()..)
                .take_while(|(name, _)| name.starts_with(prefix))
                .map(|(name, (mtime, data))| BlobMeta {
                    name: name.clone(),
                    size: data.len() as u64,
                    mtime: *mtime,
                })
                .collect()
        };
        for meta in matches {
            callback(meta)?;
        }
        Ok(())
    }

    fn get(&self, name: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>, Error> {
        let blobs = self.blobs.lock().unwrap();
        let (_, data) = blobs
            .get(name)
            .ok_or_else(|| RepoError::NotFound(format!("blob '{}'", name)))?;

        let start = offset as usize;
        if start > data.len() {
            bail!("read past end of blob '{}'", name);
        }
        let end = match length {
            Some(length) => {
                let end = start + length as usize;
                if end > data.len() {
                    bail!("read past end of blob '{}'", name);
                }
                end
            }
            None => data.len(),
        };
        Ok(data[start..end].to_vec())
    }

    fn put(&self, name: &str, data: &[u8], _options: &PutOptions) -> Result<(), Error> {
        check_blob_name(name)?;
        let mut blobs = self.blobs.lock().unwrap();
        blobs.insert(name.to_string(), (epoch_i64(), data.to_vec()));
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), Error> {
        let mut blobs = self.blobs.lock().unwrap();
        match blobs.remove(name) {
            Some(_) => Ok(()),
            None => Err(RepoError::NotFound(format!("blob '{}'", name)).into()),
        }
    }

    fn metadata(&self, name: &str) -> Result<BlobMeta, Error> {
        let blobs = self.blobs.lock().unwrap();
        match blobs.get(name) {
            Some((mtime, data)) => Ok(BlobMeta {
                name: name.to_string(),
                size: data.len() as u64,
                mtime: *mtime,
            }),
            None => Err(RepoError::NotFound(format!("blob '{}'", name)).into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::list_blobs;

    #[test]
    fn ranged_reads() {
        let store = MemoryBlobStore::new();
        store
            .put("p0123456789abcdef", b"hello world", &PutOptions::default())
            .unwrap();
        assert_eq!(store.get("p0123456789abcdef", 6, Some(5)).unwrap(), b"world");
        assert_eq!(store.get("p0123456789abcdef", 6, None).unwrap(), b"world");
        assert!(store.get("p0123456789abcdef", 6, Some(6)).is_err());
    }

    #[test]
    fn prefix_listing_is_exact() {
        let store = MemoryBlobStore::new();
        let opts = PutOptions::default();
        store.put("p0000000000000000", b"1", &opts).unwrap();
        store.put("q0000000000000000", b"2", &opts).unwrap();
        store.put("silo.repository.f", b"3", &opts).unwrap();

        assert_eq!(list_blobs(&store, "p").unwrap().len(), 1);
        assert_eq!(list_blobs(&store, "q").unwrap().len(), 1);
        assert_eq!(list_blobs(&store, "").unwrap().len(), 3);
    }
}
