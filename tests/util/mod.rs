//! Shared helpers for the end-to-end tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use silo::blobstore::{list_blobs, BlobStore, FilesystemBlobStore};
use silo::{FormatCreateOptions, Kdf, Repository, RepositoryOptions, SnapshotOptions};

pub struct TestRepo {
    pub tmp: tempfile::TempDir,
    pub store: Arc<FilesystemBlobStore>,
    pub repo: Repository,
}

pub fn create_test_repo(passphrase: &[u8]) -> TestRepo {
    let _ = env_logger::builder().is_test(true).try_init();

    let tmp = tempfile::tempdir().unwrap();
    let store_dir = tmp.path().join("store");
    let store = Arc::new(FilesystemBlobStore::create(store_dir).unwrap());

    let repo = Repository::create(
        Arc::clone(&store) as Arc<dyn BlobStore>,
        passphrase,
        FormatCreateOptions {
            kdf: Kdf::Pbkdf2Sha256,
            ..Default::default()
        },
        RepositoryOptions::default(),
    )
    .unwrap();

    TestRepo { tmp, store, repo }
}

pub fn reopen(test: &TestRepo, passphrase: &[u8]) -> Repository {
    Repository::open(
        Arc::clone(&test.store) as Arc<dyn BlobStore>,
        passphrase,
        RepositoryOptions::default(),
    )
    .unwrap()
}

pub fn snapshot_options() -> SnapshotOptions {
    SnapshotOptions {
        parallelism: 2,
        checkpoint_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

pub fn count_blobs(store: &FilesystemBlobStore, prefix: &str) -> usize {
    list_blobs(store, prefix).unwrap().len()
}

pub fn total_blob_bytes(store: &FilesystemBlobStore, prefix: &str) -> u64 {
    list_blobs(store, prefix)
        .unwrap()
        .iter()
        .map(|meta| meta.size)
        .sum()
}

/// Tiny deterministic generator so trees are reproducible across runs.
pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    pub fn bytes(&mut self, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        for chunk in data.chunks_mut(8) {
            let word = self.next_u64().to_le_bytes();
            let count = chunk.len();
            chunk.copy_from_slice(&word[..count]);
        }
        data
    }
}

/// Build the standard test tree: `levels` of nesting, `dirs` subdirs and
/// `files` files of `file_size` random bytes per level.
pub fn make_tree(
    root: &Path,
    levels: u32,
    dirs: u32,
    files: u32,
    file_size: usize,
    rng: &mut Rng,
) {
    std::fs::create_dir_all(root).unwrap();
    for file in 0..files {
        let data = rng.bytes(file_size);
        std::fs::write(root.join(format!("file-{:02}.dat", file)), data).unwrap();
    }
    if levels > 0 {
        for dir in 0..dirs {
            make_tree(
                &root.join(format!("dir-{:02}", dir)),
                levels - 1,
                dirs,
                files,
                file_size,
                rng,
            );
        }
    }
}

/// Flatten a tree into `(relative path, kind, payload)` triples for
/// comparison. Payload is file contents or the symlink target.
pub fn tree_digest(root: &Path) -> BTreeMap<PathBuf, (char, Vec<u8>)> {
    let mut digest = BTreeMap::new();
    collect_tree(root, root, &mut digest);
    digest
}

fn collect_tree(root: &Path, dir: &Path, out: &mut BTreeMap<PathBuf, (char, Vec<u8>)>) {
    for entry in std::fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        let path = entry.path();
        let rel = path.strip_prefix(root).unwrap().to_path_buf();
        let file_type = entry.file_type().unwrap();

        if file_type.is_symlink() {
            let target = std::fs::read_link(&path).unwrap();
            out.insert(rel, ('l', target.to_string_lossy().into_owned().into_bytes()));
        } else if file_type.is_dir() {
            out.insert(rel, ('d', Vec::new()));
            collect_tree(root, &path, out);
        } else {
            let data = std::fs::read(&path).unwrap();
            out.insert(rel, ('f', data));
        }
    }
}
