//! Filesystem blob store backend.
//!
//! Blob names map directly to paths below the base directory; writes go
//! through a temp file plus rename so concurrent readers never observe a
//! partial blob.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::{bail, format_err, Error};

use silo_api_types::RepoError;
use silo_tools::fs::replace_file;

use crate::names::check_blob_name;
use crate::{BlobMeta, BlobStore, PutOptions};

pub struct FilesystemBlobStore {
    base: PathBuf,
}

impl FilesystemBlobStore {
    /// Open an existing store directory.
    pub fn open<P: Into<PathBuf>>(base: P) -> Result<Self, Error> {
        let base = base.into();
        if !base.is_absolute() {
            bail!("expected absolute path - got {:?}", base);
        }
        if let Err(err) = std::fs::metadata(&base) {
            bail!("unable to open blob store at {:?} - {}", base, err);
        }
        Ok(Self { base })
    }

    /// Create the store directory (and parents) and open it.
    pub fn create<P: Into<PathBuf>>(base: P) -> Result<Self, Error> {
        let base = base.into();
        if !base.is_absolute() {
            bail!("expected absolute path - got {:?}", base);
        }
        std::fs::create_dir_all(&base)
            .map_err(|err| format_err!("unable to create blob store at {:?} - {}", base, err))?;
        Self::open(base)
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf, Error> {
        check_blob_name(name)?;
        Ok(self.base.join(name))
    }

    fn meta_from(&self, name: String, metadata: &std::fs::Metadata) -> BlobMeta {
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);
        BlobMeta {
            name,
            size: metadata.len(),
            mtime,
        }
    }
}

fn not_found(name: &str) -> Error {
    RepoError::NotFound(format!("blob '{}'", name)).into()
}

impl BlobStore for FilesystemBlobStore {
    fn list(
        &self,
        prefix: &str,
        callback: &mut dyn FnMut(BlobMeta) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for entry in walkdir::WalkDir::new(&self.base).min_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&self.base)
                .map_err(|err| format_err!("unexpected path in blob store - {}", err))?;
            let name = match relative.to_str() {
                Some(name) => name.replace(std::path::MAIN_SEPARATOR, "/"),
                None => continue, // not a blob we wrote
            };

            // skip in-flight temp files
            if name.contains(".tmp_") {
                continue;
            }

            if !name.starts_with(prefix) {
                continue;
            }

            let metadata = entry.metadata()?;
            callback(self.meta_from(name, &metadata))?;
        }
        Ok(())
    }

    fn get(&self, name: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>, Error> {
        use std::io::{Read, Seek, SeekFrom};

        let path = self.blob_path(name)?;
        let mut file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(not_found(name));
            }
            Err(err) => return Err(format_err!("unable to open blob {:?} - {}", path, err)),
        };

        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }

        let mut data = Vec::new();
        match length {
            Some(length) => {
                data.resize(length as usize, 0);
                file.read_exact(&mut data).map_err(|err| {
                    format_err!(
                        "short read on blob '{}' at {}+{} - {}",
                        name,
                        offset,
                        length,
                        err
                    )
                })?;
            }
            None => {
                file.read_to_end(&mut data)?;
            }
        }
        Ok(data)
    }

    fn put(&self, name: &str, data: &[u8], _options: &PutOptions) -> Result<(), Error> {
        let path = self.blob_path(name)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        replace_file(&path, data, true)
    }

    fn delete(&self, name: &str) -> Result<(), Error> {
        let path = self.blob_path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(not_found(name)),
            Err(err) => Err(format_err!("unable to delete blob {:?} - {}", path, err)),
        }
    }

    fn metadata(&self, name: &str) -> Result<BlobMeta, Error> {
        let path = self.blob_path(name)?;
        match std::fs::metadata(&path) {
            Ok(metadata) => Ok(self.meta_from(name.to_string(), &metadata)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(not_found(name)),
            Err(err) => Err(format_err!("unable to stat blob {:?} - {}", path, err)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{get_blob, list_blobs};
    use silo_api_types::is_not_found;

    #[test]
    fn put_get_list_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::create(dir.path().to_owned()).unwrap();

        store
            .put("pabcdef0123456789", b"pack data", &PutOptions::default())
            .unwrap();
        store
            .put("log/2024-05-01/run.log", b"log line", &PutOptions::default())
            .unwrap();

        assert_eq!(get_blob(&store, "pabcdef0123456789").unwrap(), b"pack data");
        assert_eq!(store.get("pabcdef0123456789", 5, Some(4)).unwrap(), b"data");

        let packs = list_blobs(&store, "p").unwrap();
        assert_eq!(packs.len(), 1);
        assert_eq!(packs[0].size, 9);

        let logs = list_blobs(&store, "log/").unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].name, "log/2024-05-01/run.log");

        store.delete("pabcdef0123456789").unwrap();
        let err = get_blob(&store, "pabcdef0123456789").unwrap_err();
        assert!(is_not_found(&err));
        let err = store.delete("pabcdef0123456789").unwrap_err();
        assert!(is_not_found(&err));
    }

    #[test]
    fn overwrite_is_atomic_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::create(dir.path().to_owned()).unwrap();
        store
            .put("silo.repository.f", b"v1", &PutOptions::default())
            .unwrap();
        store
            .put("silo.repository.f", b"v2", &PutOptions::default())
            .unwrap();
        assert_eq!(get_blob(&store, "silo.repository.f").unwrap(), b"v2");
    }
}
