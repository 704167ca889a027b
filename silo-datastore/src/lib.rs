//! The silo storage core.
//!
//! # Layers
//!
//! Contents are immutable plaintext byte strings addressed by an
//! HMAC-SHA-256 digest under a repository-secret key. They are
//! compressed, encrypted and concatenated into pack blobs on a dumb
//! blob store; index blobs map content ids to pack locations and are
//! organized in epochs so concurrent writers never contend. Objects
//! (arbitrary byte streams) sit on top of contents via content-defined
//! chunking and indirect blocks; the manifest store keeps small labeled
//! JSON records (snapshots, policies, maintenance state) as contents in
//! their own namespace.
//!
//! # Garbage collection
//!
//! Deleting a snapshot only removes its manifest. Maintenance walks all
//! live snapshot manifests through the object graph, tombstones
//! unreferenced contents after a safety window, rewrites underfilled
//! packs and deletes dead blobs once both the tombstones and the blobs
//! aged out. Deleted contents can be undeleted until their pack is
//! physically gone; maintenance revives referenced-but-tombstoned
//! contents automatically.
//!
//! # Locking
//!
//! A single process may run many writers: the pending pack buffers are
//! guarded by one mutex, the committed index by an RwLock. Between
//! processes, correctness rests on the epoch index protocol (union
//! merge, newest entry wins) and on the deletion safety windows, not on
//! locks.

pub mod cache;
pub mod chunker;
pub mod content;
pub mod epoch;
pub mod file_formats;
pub mod frame;
pub mod index;
pub mod maintenance;
pub mod manifest_store;
pub mod object;
pub mod pack;
pub mod repository;

pub use cache::{is_inside_cache_dir, CachingBlobStore, LocalCache, CACHE_MARKER_NAME};
pub use chunker::{Chunker, SplitterConfig};
pub use content::{ContentManager, ContentOptions};
pub use epoch::EpochOptions;
pub use frame::DataFrame;
pub use index::{CombinedIndex, IndexEntry};
pub use maintenance::{
    MaintenanceOptions, MaintenanceSchedule, SafetyParams, SAFETY_FULL, SAFETY_NONE,
};
pub use manifest_store::{ManifestRecord, ManifestStore};
pub use object::{ObjectManager, ObjectReader};
pub use pack::PackBuilder;
pub use repository::{default_identity, Repository, RepositoryOptions};
