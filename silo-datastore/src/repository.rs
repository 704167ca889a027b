//! The repository facade: ties the blob store, format blob, content,
//! object and manifest layers together.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Error};
use serde_json::Value;

use silo_api_types::{
    is_not_found, ManifestId, RepoError, RepositoryStatus, SnapshotManifest, SnapshotSource,
    MANIFEST_TYPE_LABEL, MANIFEST_TYPE_SNAPSHOT,
};
use silo_blobstore::{names, BlobStore, PutOptions, RetryBlobStore, RetryOptions};
use silo_key_config::{BlobRetentionConfig, FormatCreateOptions, RepositoryFormat};
use silo_tools::CryptConfig;

use crate::cache::{CachingBlobStore, LocalCache};
use crate::chunker::SplitterConfig;
use crate::content::{ContentManager, ContentOptions};
use crate::manifest_store::{ManifestStore, DEFAULT_MANIFEST_CACHE_DURATION};
use crate::object::ObjectManager;
use crate::pack::read_format_prelude;

/// Options applied when opening (or creating) a repository.
#[derive(Clone)]
pub struct RepositoryOptions {
    pub read_only: bool,
    /// Blob-level retention config written next to the format blob at
    /// creation time (`silo.blobcfg`).
    pub blob_retention: Option<BlobRetentionConfig>,
    /// Local cache directory and its byte budget.
    pub cache: Option<(PathBuf, u64)>,
    pub content: ContentOptions,
    pub manifest_cache_duration: Duration,
    pub retry: RetryOptions,
    /// Identity override (`user@host` is derived from the environment by
    /// default).
    pub identity: Option<String>,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            blob_retention: None,
            cache: None,
            content: ContentOptions::default(),
            manifest_cache_duration: DEFAULT_MANIFEST_CACHE_DURATION,
            retry: RetryOptions::default(),
            identity: None,
        }
    }
}

pub struct Repository {
    store: Arc<dyn BlobStore>,
    format: RepositoryFormat,
    crypt: Arc<CryptConfig>,
    content: Arc<ContentManager>,
    objects: Arc<ObjectManager>,
    manifests: Mutex<ManifestStore>,
    identity: String,
    session_blob: Option<String>,
    cache_root: Option<PathBuf>,
    read_only: bool,
}

/// `user@host` of the current process.
pub fn default_identity() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "root".to_string());
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", user, host)
}

impl Repository {
    /// Initialize a new repository on an empty blob store.
    pub fn create(
        store: Arc<dyn BlobStore>,
        passphrase: &[u8],
        format_options: FormatCreateOptions,
        options: RepositoryOptions,
    ) -> Result<Self, Error> {
        if store.metadata(names::FORMAT_BLOB_NAME).is_ok() {
            return Err(
                RepoError::Conflict("blob store already contains a repository".to_string()).into(),
            );
        }

        let deny_recovery = format_options.deny_format_recovery;
        let format = RepositoryFormat::create(passphrase, format_options)?;
        let format_bytes = format.to_bytes()?;
        store.put(names::FORMAT_BLOB_NAME, &format_bytes, &PutOptions::default())?;

        if let Some(retention) = &options.blob_retention {
            store.put(
                names::BLOB_CFG_NAME,
                &retention.to_bytes()?,
                &PutOptions::default(),
            )?;
        }

        let repo = Self::open(store, passphrase, options)?;
        if !deny_recovery {
            // disaster recovery copy rides along in the first data pack
            repo.content.set_format_prelude(&format_bytes);
        }
        Ok(repo)
    }

    /// Open an existing repository.
    pub fn open(
        store: Arc<dyn BlobStore>,
        passphrase: &[u8],
        options: RepositoryOptions,
    ) -> Result<Self, Error> {
        let format_bytes = store.get(names::FORMAT_BLOB_NAME, 0, None).map_err(|err| {
            if is_not_found(&err) {
                Error::from(RepoError::NotFound(
                    "blob store does not contain a repository".to_string(),
                ))
            } else {
                err
            }
        })?;
        let format = RepositoryFormat::from_bytes(&format_bytes)?;
        let crypt = Arc::new(format.open(passphrase)?);

        let retry_store: Arc<dyn BlobStore> =
            Arc::new(RetryBlobStore::new(store, options.retry.clone()));

        let (store, cache_root) = match &options.cache {
            Some((root, budget)) => {
                let cache = Arc::new(LocalCache::open(root.clone(), *budget)?);
                let caching: Arc<dyn BlobStore> =
                    Arc::new(CachingBlobStore::new(retry_store, Arc::clone(&cache)));
                (caching, Some(cache.root().to_path_buf()))
            }
            None => (retry_store, None),
        };

        let content = Arc::new(ContentManager::open(
            Arc::clone(&store),
            Arc::clone(&crypt),
            options.content.clone(),
        )?);

        let splitter = SplitterConfig::new(
            format.splitter_min,
            format.splitter_avg,
            format.splitter_max,
        );
        let objects = Arc::new(ObjectManager::new(Arc::clone(&content), splitter));

        let manifests = ManifestStore::open(Arc::clone(&content), options.manifest_cache_duration)?;

        let identity = options.identity.clone().unwrap_or_else(default_identity);

        let session_blob = if options.read_only {
            None
        } else {
            let name = names::new_session_name();
            store.put(&name, identity.as_bytes(), &PutOptions::default())?;
            Some(name)
        };

        Ok(Self {
            store,
            format,
            crypt,
            content,
            objects,
            manifests: Mutex::new(manifests),
            identity,
            session_blob,
            cache_root,
            read_only: options.read_only,
        })
    }

    /// The blob-level retention config, if the repository carries one.
    pub fn blob_retention(&self) -> Result<Option<BlobRetentionConfig>, Error> {
        match self.store.get(names::BLOB_CFG_NAME, 0, None) {
            Ok(data) => Ok(Some(BlobRetentionConfig::from_bytes(&data)?)),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Recover the repository format from the copy embedded in a data
    /// pack, for when the format blob itself was lost.
    pub fn recover_format(store: &dyn BlobStore) -> Result<RepositoryFormat, Error> {
        let mut packs = Vec::new();
        store.list(names::DATA_PACK_PREFIX, &mut |meta| {
            if names::is_pack_name(&meta.name) {
                packs.push(meta.name);
            }
            Ok(())
        })?;
        packs.sort();

        for pack in packs {
            if let Some(bytes) = read_format_prelude(store, &pack)? {
                log::info!("recovered format blob from pack '{}'", pack);
                return RepositoryFormat::from_bytes(&bytes);
            }
        }

        Err(RepoError::NotFound("no format recovery copy found".to_string()).into())
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn format(&self) -> &RepositoryFormat {
        &self.format
    }

    pub fn crypt(&self) -> &Arc<CryptConfig> {
        &self.crypt
    }

    pub fn content(&self) -> &Arc<ContentManager> {
        &self.content
    }

    pub fn objects(&self) -> &Arc<ObjectManager> {
        &self.objects
    }

    pub fn manifests(&self) -> MutexGuard<'_, ManifestStore> {
        self.manifests.lock().unwrap()
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn cache_root(&self) -> Option<&PathBuf> {
        self.cache_root.as_ref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn status(&self) -> RepositoryStatus {
        self.format.status(self.read_only)
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.read_only {
            return Err(
                RepoError::Unauthorized("repository opened read-only".to_string()).into(),
            );
        }
        Ok(())
    }

    /// Persist all pending contents and manifests.
    pub fn flush(&self) -> Result<(), Error> {
        self.check_writable()?;
        self.content.flush()
    }

    /// Flush and remove this process' session marker.
    pub fn close(&mut self) -> Result<(), Error> {
        if !self.read_only {
            self.content.flush()?;
        }
        if let Some(name) = self.session_blob.take() {
            match self.store.delete(&name) {
                Ok(()) => (),
                Err(err) if is_not_found(&err) => (),
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Re-read backend state (indexes and manifest catalog).
    pub fn refresh(&self) -> Result<(), Error> {
        self.content.refresh()?;
        self.manifests().refresh(true)
    }

    // --- snapshot manifest helpers -------------------------------------

    /// Store a snapshot manifest.
    pub fn put_snapshot_manifest(&self, manifest: &SnapshotManifest) -> Result<ManifestId, Error> {
        self.check_writable()?;
        let labels = SnapshotManifest::labels(&manifest.source);
        let payload = serde_json::to_value(manifest)?;
        self.manifests().put(labels, payload)
    }

    /// Load one snapshot manifest by id.
    pub fn get_snapshot_manifest(&self, id: &ManifestId) -> Result<SnapshotManifest, Error> {
        let manifests = self.manifests();
        let record = manifests.get(id)?;
        let mut manifest: SnapshotManifest = serde_json::from_value(record.payload.clone())
            .map_err(|err| RepoError::Corrupt(format!("snapshot manifest {} - {}", id, err)))?;
        manifest.id = Some(record.id.clone());
        Ok(manifest)
    }

    /// All snapshot manifests, optionally restricted to one source.
    pub fn list_snapshot_manifests(
        &self,
        source: Option<&SnapshotSource>,
    ) -> Result<Vec<SnapshotManifest>, Error> {
        let labels = match source {
            Some(source) => SnapshotManifest::labels(source),
            None => {
                let mut labels = BTreeMap::new();
                labels.insert(
                    MANIFEST_TYPE_LABEL.to_string(),
                    MANIFEST_TYPE_SNAPSHOT.to_string(),
                );
                labels
            }
        };

        let manifests = self.manifests();
        let mut result = Vec::new();
        for record in manifests.find(&labels) {
            let mut manifest: SnapshotManifest = serde_json::from_value(record.payload.clone())
                .with_context(|| format!("snapshot manifest {}", record.id))?;
            manifest.id = Some(record.id.clone());
            result.push(manifest);
        }
        Ok(result)
    }

    /// Delete a snapshot manifest (the data stays until maintenance).
    pub fn delete_snapshot_manifest(&self, id: &ManifestId) -> Result<(), Error> {
        self.check_writable()?;
        self.manifests().delete(id)
    }

    /// The most recent complete snapshot of a source, if any.
    pub fn latest_complete_snapshot(
        &self,
        source: &SnapshotSource,
    ) -> Result<Option<SnapshotManifest>, Error> {
        let mut snapshots = self.list_snapshot_manifests(Some(source))?;
        snapshots.retain(|manifest| manifest.is_complete());
        snapshots.sort_by_key(|manifest| manifest.start_time);
        Ok(snapshots.pop())
    }

    /// Store an arbitrary manifest payload (policies etc).
    pub fn put_manifest(
        &self,
        labels: BTreeMap<String, String>,
        payload: Value,
    ) -> Result<ManifestId, Error> {
        self.check_writable()?;
        self.manifests().put(labels, payload)
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        if let Some(name) = self.session_blob.take() {
            let _ = self.store.delete(&name);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use silo_blobstore::{list_blobs, MemoryBlobStore};
    use silo_key_config::Kdf;

    pub(crate) fn fast_format_options() -> FormatCreateOptions {
        FormatCreateOptions {
            kdf: Kdf::Pbkdf2Sha256,
            ..Default::default()
        }
    }

    #[test]
    fn create_open_status_roundtrip() {
        let store = Arc::new(MemoryBlobStore::new());

        let created = Repository::create(
            Arc::clone(&store) as Arc<dyn BlobStore>,
            b"passphrase",
            fast_format_options(),
            RepositoryOptions::default(),
        )
        .unwrap();
        let created_status = created.status();
        drop(created);

        let opened = Repository::open(
            Arc::clone(&store) as Arc<dyn BlobStore>,
            b"passphrase",
            RepositoryOptions::default(),
        )
        .unwrap();
        let opened_status = opened.status();

        assert_eq!(created_status.unique_id, opened_status.unique_id);
        assert_eq!(created_status.splitter_avg, opened_status.splitter_avg);
        assert!(!opened_status.read_only);
    }

    #[test]
    fn create_twice_conflicts() {
        let store = Arc::new(MemoryBlobStore::new());
        let _repo = Repository::create(
            Arc::clone(&store) as Arc<dyn BlobStore>,
            b"passphrase",
            fast_format_options(),
            RepositoryOptions::default(),
        )
        .unwrap();

        let err = Repository::create(
            Arc::clone(&store) as Arc<dyn BlobStore>,
            b"passphrase",
            fast_format_options(),
            RepositoryOptions::default(),
        )
        .unwrap_err();
        assert!(silo_api_types::is_conflict(&err));
    }

    #[test]
    fn wrong_passphrase_fails_open() {
        let store = Arc::new(MemoryBlobStore::new());
        let _repo = Repository::create(
            Arc::clone(&store) as Arc<dyn BlobStore>,
            b"passphrase",
            fast_format_options(),
            RepositoryOptions::default(),
        )
        .unwrap();

        let err = Repository::open(
            Arc::clone(&store) as Arc<dyn BlobStore>,
            b"nope nope",
            RepositoryOptions::default(),
        )
        .unwrap_err();
        assert!(silo_api_types::is_wrong_passphrase(&err));
    }

    #[test]
    fn session_markers_come_and_go() {
        let store = Arc::new(MemoryBlobStore::new());
        {
            let mut repo = Repository::create(
                Arc::clone(&store) as Arc<dyn BlobStore>,
                b"passphrase",
                fast_format_options(),
                RepositoryOptions::default(),
            )
            .unwrap();

            let sessions: Vec<_> = list_blobs(store.as_ref(), "s")
                .unwrap()
                .into_iter()
                .filter(|meta| names::is_session_name(&meta.name))
                .collect();
            assert_eq!(sessions.len(), 1);
            repo.close().unwrap();
        }

        let sessions: Vec<_> = list_blobs(store.as_ref(), "s")
            .unwrap()
            .into_iter()
            .filter(|meta| names::is_session_name(&meta.name))
            .collect();
        assert!(sessions.is_empty());
    }

    #[test]
    fn read_only_refuses_writes() {
        let store = Arc::new(MemoryBlobStore::new());
        {
            let _repo = Repository::create(
                Arc::clone(&store) as Arc<dyn BlobStore>,
                b"passphrase",
                fast_format_options(),
                RepositoryOptions::default(),
            )
            .unwrap();
        }

        let repo = Repository::open(
            Arc::clone(&store) as Arc<dyn BlobStore>,
            b"passphrase",
            RepositoryOptions {
                read_only: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(repo.flush().is_err());
    }

    #[test]
    fn format_recovery_from_pack() {
        let store = Arc::new(MemoryBlobStore::new());
        let unique_id = {
            let repo = Repository::create(
                Arc::clone(&store) as Arc<dyn BlobStore>,
                b"passphrase",
                fast_format_options(),
                RepositoryOptions::default(),
            )
            .unwrap();
            // any data content lands in the first data pack, after the
            // format copy prelude
            repo.content()
                .write_content(b"payload", silo_api_types::NS_NONE)
                .unwrap();
            repo.flush().unwrap();
            repo.format().unique_id.clone()
        };

        store.delete(names::FORMAT_BLOB_NAME).unwrap();
        let recovered = Repository::recover_format(store.as_ref()).unwrap();
        assert_eq!(recovered.unique_id, unique_id);
    }

    #[test]
    fn denied_recovery_embeds_no_copy() {
        let store = Arc::new(MemoryBlobStore::new());
        {
            let repo = Repository::create(
                Arc::clone(&store) as Arc<dyn BlobStore>,
                b"passphrase",
                FormatCreateOptions {
                    kdf: Kdf::Pbkdf2Sha256,
                    deny_format_recovery: true,
                    ..Default::default()
                },
                RepositoryOptions::default(),
            )
            .unwrap();
            repo.content()
                .write_content(b"payload", silo_api_types::NS_NONE)
                .unwrap();
            repo.flush().unwrap();
        }

        store.delete(names::FORMAT_BLOB_NAME).unwrap();
        assert!(Repository::recover_format(store.as_ref()).is_err());
    }
}
