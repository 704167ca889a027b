//! The snapshot walker and uploader.

use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use anyhow::{bail, format_err, Context, Error};

use silo_api_types::{
    DirEntry, DirSummary, DirectoryManifest, EntryKind, ManifestId, ObjectId, RepoError,
    SnapshotManifest, SnapshotSource, SnapshotStats,
};
use silo_datastore::maintenance::read_directory;
use silo_datastore::{is_inside_cache_dir, ObjectManager, Repository, CACHE_MARKER_NAME};
use silo_tools::time::epoch_i64;
use silo_tools::{CancelToken, WorkerPool};

use super::ignore::IgnoreStack;
use super::{SnapshotOptions, SnapshotResult, CHECKPOINT_REASON};

/// Suffix of shallow-restore placeholder files.
pub const PLACEHOLDER_SUFFIX: &str = ".silo-entry";

/// Suffix of shallow-restore placeholder directories; such a directory
/// contains a single marker file of the same name.
pub const PLACEHOLDER_DIR_MARKER: &str = ".silo-dir";

type FileResult = Result<ObjectId, String>;

struct BatchState {
    remaining: usize,
    results: Vec<Option<FileResult>>,
}

/// Completion tracking for the file-hash jobs of one directory.
struct Batch {
    state: Mutex<BatchState>,
    done: Condvar,
}

impl Batch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BatchState {
                remaining: 0,
                results: Vec::new(),
            }),
            done: Condvar::new(),
        })
    }

    fn add_slot(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.results.push(None);
        state.remaining += 1;
        state.results.len() - 1
    }

    fn complete(&self, slot: usize, result: FileResult) {
        let mut state = self.state.lock().unwrap();
        state.results[slot] = Some(result);
        state.remaining -= 1;
        self.done.notify_all();
    }

    fn wait(&self) -> Vec<Option<FileResult>> {
        let mut state = self.state.lock().unwrap();
        while state.remaining > 0 {
            state = self.done.wait(state).unwrap();
        }
        std::mem::take(&mut state.results)
    }
}

struct FileJob {
    path: PathBuf,
    slot: usize,
    batch: Arc<Batch>,
}

/// A file job dispatched to the pool, waiting for its object id.
struct PendingFile {
    entry_index: usize,
    slot: usize,
    name: String,
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    mtime: i64,
    mtime_ns: u32,
}

pub(crate) struct Uploader<'a> {
    repo: &'a Repository,
    options: &'a SnapshotOptions,
    cancel: &'a CancelToken,
    pool: WorkerPool<FileJob>,
    ignore: IgnoreStack,
    stats: SnapshotStats,
    source: Option<SnapshotSource>,
    start_time: i64,
    last_checkpoint: Instant,
    checkpoints: Vec<ManifestId>,
    /// Completed top-level entries, the basis for checkpoint roots.
    completed_top: Vec<DirEntry>,
}

fn hash_file(objects: &ObjectManager, path: &Path) -> Result<ObjectId, Error> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("unable to open {:?}", path))?;
    objects
        .write_object(&mut file, false)
        .with_context(|| format!("hashing {:?}", path))
}

impl<'a> Uploader<'a> {
    pub(crate) fn new(
        repo: &'a Repository,
        options: &'a SnapshotOptions,
        cancel: &'a CancelToken,
    ) -> Result<Self, Error> {
        let objects = Arc::clone(repo.objects());
        let pool_cancel = cancel.clone();

        // per-file failures travel through the batch so the walker can
        // apply its error policy; the pool token only carries
        // cancellation
        let pool = WorkerPool::spawn(
            "snapshot-hasher",
            options.parallelism,
            cancel.clone(),
            move |job: FileJob| {
                if pool_cancel.is_canceled() {
                    job.batch
                        .complete(job.slot, Err("operation canceled".to_string()));
                    return Ok(());
                }
                let result = hash_file(&objects, &job.path).map_err(|err| format!("{:#}", err));
                job.batch.complete(job.slot, result);
                Ok(())
            },
        );

        Ok(Self {
            repo,
            options,
            cancel,
            pool,
            ignore: IgnoreStack::new(&options.ignore_patterns)?,
            stats: SnapshotStats::default(),
            source: None,
            start_time: 0,
            last_checkpoint: Instant::now(),
            checkpoints: Vec::new(),
            completed_top: Vec::new(),
        })
    }

    pub(crate) fn run(mut self, paths: &[PathBuf]) -> Result<SnapshotResult, Error> {
        let mut sources = Vec::with_capacity(paths.len());
        for path in paths {
            let canonical = std::fs::canonicalize(path)
                .with_context(|| format!("resolving snapshot source {:?}", path))?;
            if !canonical.is_dir() {
                bail!("snapshot source {:?} is not a directory", canonical);
            }
            if is_inside_cache_dir(&canonical) {
                return Err(RepoError::PolicyViolation(format!(
                    "snapshot source {:?} is inside a repository cache directory",
                    canonical
                ))
                .into());
            }
            sources.push(canonical);
        }

        let mut source = super::snapshot_source(&sources)?;
        if let Some((user, host)) = self.repo.identity().split_once('@') {
            source.user_name = user.to_string();
            source.host = host.to_string();
        }
        self.source = Some(source.clone());
        self.start_time = epoch_i64();

        let previous = if self.options.use_previous_manifest {
            self.repo.latest_complete_snapshot(&source)?
        } else {
            None
        };
        let previous_root = previous
            .as_ref()
            .and_then(|manifest| self.load_previous_dir(&manifest.root_entry));

        let root_entry = if sources.len() == 1 {
            self.snapshot_dir(&sources[0], Path::new(""), "/", previous_root, true)?
        } else {
            self.combine_sources(&sources, previous_root)?
        };

        let manifest = SnapshotManifest {
            id: None,
            source,
            description: self.options.description.clone(),
            start_time: self.start_time,
            end_time: epoch_i64(),
            stats: self.stats.clone(),
            incomplete: None,
            root_entry,
            retention_reasons: Vec::new(),
            tags: self.options.tags.clone(),
        };

        let manifest_id = self.repo.put_snapshot_manifest(&manifest)?;

        // the final manifest supersedes this run's checkpoints
        for checkpoint in std::mem::take(&mut self.checkpoints) {
            match self.repo.delete_snapshot_manifest(&checkpoint) {
                Ok(()) => (),
                Err(err) if silo_api_types::is_not_found(&err) => (),
                Err(err) => return Err(err),
            }
        }

        self.repo.flush()?;

        let mut manifest = manifest;
        manifest.id = Some(manifest_id.clone());
        if manifest.stats.ignored_error_count > 0 {
            log::warn!(
                "snapshot of {} completed with {} ignored errors",
                manifest.source,
                manifest.stats.ignored_error_count
            );
        }

        Ok(SnapshotResult {
            manifest_id,
            manifest,
        })
    }

    fn combine_sources(
        &mut self,
        sources: &[PathBuf],
        previous_root: Option<DirectoryManifest>,
    ) -> Result<DirEntry, Error> {
        let mut entries = Vec::with_capacity(sources.len());
        let mut seen = std::collections::HashSet::new();

        for path in sources {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| format_err!("source {:?} has no usable name", path))?;
            if !seen.insert(name.clone()) {
                return Err(RepoError::Conflict(format!(
                    "combined sources would both be named '{}'",
                    name
                ))
                .into());
            }

            let previous_child = previous_root
                .as_ref()
                .and_then(|manifest| manifest.lookup(&name))
                .and_then(|entry| self.load_previous_dir(entry));

            let entry = self.snapshot_dir(path, Path::new(&name), &name, previous_child, true)?;
            self.completed_top.push(entry.clone());
            entries.push(entry);
            self.maybe_checkpoint()?;
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        self.encode_directory(entries, "/", 0o755, 0, 0, self.start_time, 0)
    }

    /// Load the directory manifest behind a previous snapshot's entry,
    /// tolerating any failure (the cache is an optimization only).
    fn load_previous_dir(&self, entry: &DirEntry) -> Option<DirectoryManifest> {
        if entry.kind != EntryKind::Dir {
            return None;
        }
        let object_id = entry.obj.as_ref()?;
        match read_directory(self.repo, object_id) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                log::warn!("unable to load previous directory manifest: {}", err);
                None
            }
        }
    }

    fn snapshot_dir(
        &mut self,
        abs: &Path,
        rel: &Path,
        name: &str,
        previous: Option<DirectoryManifest>,
        is_root: bool,
    ) -> Result<DirEntry, Error> {
        self.cancel.check()?;

        let dir_metadata = std::fs::symlink_metadata(abs)
            .with_context(|| format!("unable to stat {:?}", abs))?;

        let ignore_mark = self.ignore.mark();
        self.ignore.load_ignore_file(abs, rel);

        let result = self.snapshot_dir_inner(abs, rel, previous, is_root);
        self.ignore.truncate(ignore_mark);
        let entries = result?;

        self.stats.total_directory_count += 1;
        self.encode_directory(
            entries,
            name,
            dir_metadata.mode() & 0o7777,
            dir_metadata.uid(),
            dir_metadata.gid(),
            dir_metadata.mtime(),
            dir_metadata.mtime_nsec() as u32,
        )
    }

    fn snapshot_dir_inner(
        &mut self,
        abs: &Path,
        rel: &Path,
        previous: Option<DirectoryManifest>,
        is_root: bool,
    ) -> Result<Vec<DirEntry>, Error> {
        let mut children: Vec<(String, std::io::Result<std::fs::Metadata>)> = Vec::new();
        for dir_entry in
            std::fs::read_dir(abs).with_context(|| format!("unable to read {:?}", abs))?
        {
            let dir_entry = dir_entry?;
            let name = match dir_entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    log::warn!("skipping entry with non-utf8 name {:?}", raw);
                    self.stats.excluded_file_count += 1;
                    continue;
                }
            };
            children.push((name, dir_entry.metadata()));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));

        let batch = Batch::new();
        let mut entries: Vec<Option<DirEntry>> = Vec::with_capacity(children.len());
        let mut pending_files: Vec<PendingFile> = Vec::new();

        for (child_name, metadata) in children {
            let metadata = match metadata {
                Ok(metadata) => metadata,
                Err(err) => {
                    let err = Error::from(err)
                        .context(format!("unable to stat {:?}", abs.join(&child_name)));
                    self.file_error(&mut entries, child_name, err)?;
                    continue;
                }
            };
            self.cancel.check()?;

            let child_rel = rel.join(&child_name);
            if self.ignore.is_excluded(&child_rel, metadata.mode()) {
                self.stats.excluded_file_count += 1;
                continue;
            }

            let file_type = metadata.file_type();

            if file_type.is_dir() {
                let child_abs = abs.join(&child_name);

                // never back a cache directory up into itself
                if child_abs.join(CACHE_MARKER_NAME).is_file() {
                    log::info!("skipping cache directory {:?}", child_abs);
                    self.stats.excluded_file_count += 1;
                    continue;
                }

                // re-inline shallow placeholder directories
                if child_name.ends_with(PLACEHOLDER_DIR_MARKER) {
                    if let Some(entry) = self.parse_placeholder(&child_abs.join(PLACEHOLDER_DIR_MARKER))
                    {
                        entries.push(Some(entry));
                        continue;
                    }
                }

                let previous_child = previous
                    .as_ref()
                    .and_then(|manifest| manifest.lookup(&child_name))
                    .and_then(|entry| self.load_previous_dir(entry));

                match self.snapshot_dir(&child_abs, &child_rel, &child_name, previous_child, false)
                {
                    Ok(entry) => {
                        if is_root {
                            self.completed_top.push(entry.clone());
                        }
                        entries.push(Some(entry));
                    }
                    Err(err) if silo_api_types::is_canceled(&err) => return Err(err),
                    Err(err) => {
                        if self.options.ignore_dir_errors {
                            log::warn!("ignoring directory error at {:?}: {:#}", child_abs, err);
                            self.stats.ignored_error_count += 1;
                            entries.push(Some(DirEntry::error_entry(
                                child_name,
                                format!("{:#}", err),
                            )));
                        } else {
                            self.stats.fatal_error_count += 1;
                            return Err(err);
                        }
                    }
                }

                if is_root {
                    self.maybe_checkpoint()?;
                }
                continue;
            }

            if file_type.is_symlink() {
                match std::fs::read_link(abs.join(&child_name)) {
                    Ok(target) => entries.push(Some(DirEntry {
                        name: child_name,
                        kind: EntryKind::Symlink,
                        mode: metadata.mode() & 0o7777,
                        uid: metadata.uid(),
                        gid: metadata.gid(),
                        size: 0,
                        mtime: metadata.mtime(),
                        mtime_ns: metadata.mtime_nsec() as u32,
                        obj: None,
                        target: Some(target.to_string_lossy().into_owned()),
                        error: None,
                        summ: None,
                    })),
                    Err(err) => self.file_error(&mut entries, child_name, err.into())?,
                }
                continue;
            }

            let is_pipe = file_type.is_fifo();
            if !file_type.is_file() && !(is_pipe && self.options.snapshot_named_pipes) {
                if is_pipe {
                    log::debug!("skipping named pipe {:?}", abs.join(&child_name));
                } else {
                    log::debug!("skipping special file {:?}", abs.join(&child_name));
                }
                self.stats.excluded_file_count += 1;
                continue;
            }

            // re-inline shallow placeholder files
            if child_name.ends_with(PLACEHOLDER_SUFFIX) {
                if let Some(entry) = self.parse_placeholder(&abs.join(&child_name)) {
                    entries.push(Some(entry));
                    continue;
                }
            }

            // metadata dedup against the previous snapshot
            if let Some(prev_entry) = previous
                .as_ref()
                .and_then(|manifest| manifest.lookup(&child_name))
            {
                if prev_entry.kind == EntryKind::File
                    && prev_entry.mtime == metadata.mtime()
                    && prev_entry.mtime_ns == metadata.mtime_nsec() as u32
                    && prev_entry.size == metadata.len()
                    && prev_entry.obj.is_some()
                {
                    self.stats.cached_files += 1;
                    self.stats.total_file_count += 1;
                    self.stats.total_file_size += metadata.len();
                    entries.push(Some(DirEntry {
                        name: child_name,
                        kind: EntryKind::File,
                        mode: metadata.mode() & 0o7777,
                        uid: metadata.uid(),
                        gid: metadata.gid(),
                        size: metadata.len(),
                        mtime: metadata.mtime(),
                        mtime_ns: metadata.mtime_nsec() as u32,
                        obj: prev_entry.obj.clone(),
                        target: None,
                        error: None,
                        summ: None,
                    }));
                    continue;
                }
            }

            // hash on the worker pool
            let slot = batch.add_slot();
            pending_files.push(PendingFile {
                entry_index: entries.len(),
                slot,
                name: child_name.clone(),
                mode: metadata.mode() & 0o7777,
                uid: metadata.uid(),
                gid: metadata.gid(),
                size: metadata.len(),
                mtime: metadata.mtime(),
                mtime_ns: metadata.mtime_nsec() as u32,
            });
            entries.push(None);
            self.pool.dispatch(FileJob {
                path: abs.join(&child_name),
                slot,
                batch: Arc::clone(&batch),
            })?;
        }

        let results = batch.wait();
        self.cancel.check()?;

        for pending in pending_files {
            let result = results[pending.slot]
                .as_ref()
                .ok_or_else(|| format_err!("missing hash result for '{}'", pending.name))?;

            match result {
                Ok(object_id) => {
                    self.stats.non_cached_files += 1;
                    self.stats.total_file_count += 1;
                    self.stats.total_file_size += pending.size;
                    entries[pending.entry_index] = Some(DirEntry {
                        name: pending.name,
                        kind: EntryKind::File,
                        mode: pending.mode,
                        uid: pending.uid,
                        gid: pending.gid,
                        size: pending.size,
                        mtime: pending.mtime,
                        mtime_ns: pending.mtime_ns,
                        obj: Some(object_id.clone()),
                        target: None,
                        error: None,
                        summ: None,
                    });
                }
                Err(message) => {
                    if self.options.ignore_file_errors {
                        log::warn!("ignoring file error: {}", message);
                        self.stats.ignored_error_count += 1;
                        entries[pending.entry_index] =
                            Some(DirEntry::error_entry(pending.name, message.clone()));
                    } else {
                        self.stats.fatal_error_count += 1;
                        bail!("{}", message);
                    }
                }
            }
        }

        let mut resolved: Vec<DirEntry> = entries.into_iter().flatten().collect();
        resolved.sort_by(|a, b| a.name.cmp(&b.name));
        for pair in resolved.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(RepoError::Conflict(format!(
                    "duplicate entry '{}' in {:?}",
                    pair[0].name, abs
                ))
                .into());
            }
        }

        Ok(resolved)
    }

    fn file_error(
        &mut self,
        entries: &mut Vec<Option<DirEntry>>,
        name: String,
        err: Error,
    ) -> Result<(), Error> {
        if self.options.ignore_file_errors {
            log::warn!("ignoring error for '{}': {:#}", name, err);
            self.stats.ignored_error_count += 1;
            entries.push(Some(DirEntry::error_entry(name, format!("{:#}", err))));
            Ok(())
        } else {
            self.stats.fatal_error_count += 1;
            Err(err)
        }
    }

    fn parse_placeholder(&mut self, path: &Path) -> Option<DirEntry> {
        let data = std::fs::read(path).ok()?;
        match serde_json::from_slice::<DirEntry>(&data) {
            Ok(entry) => {
                self.stats.cached_files += 1;
                Some(entry)
            }
            Err(err) => {
                log::warn!("placeholder {:?} is unparseable, treating as data: {}", path, err);
                None
            }
        }
    }

    /// Serialize a directory manifest, store it as a metadata object and
    /// build the directory's entry.
    #[allow(clippy::too_many_arguments)]
    fn encode_directory(
        &mut self,
        entries: Vec<DirEntry>,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: i64,
        mtime_ns: u32,
    ) -> Result<DirEntry, Error> {
        let mut summary = DirSummary::default();
        for entry in &entries {
            match entry.kind {
                EntryKind::File => {
                    summary.file_count += 1;
                    summary.total_size += entry.size;
                }
                EntryKind::Dir => {
                    summary.dir_count += 1;
                    if let Some(child_summary) = &entry.summ {
                        summary.add(child_summary);
                    }
                }
                EntryKind::Symlink => summary.symlink_count += 1,
                EntryKind::Error => summary.error_count += 1,
            }
            summary.max_mtime = summary.max_mtime.max(entry.mtime);
        }

        let manifest = DirectoryManifest {
            summary: summary.clone(),
            entries,
        };
        let data = serde_json::to_vec(&manifest)?;
        let object_id = self.repo.objects().write_object_bytes(&data, true)?;

        Ok(DirEntry {
            name: name.to_string(),
            kind: EntryKind::Dir,
            mode,
            uid,
            gid,
            size: 0,
            mtime,
            mtime_ns,
            obj: Some(object_id),
            target: None,
            error: None,
            summ: Some(summary),
        })
    }

    /// Write a checkpoint manifest covering the completed top-level
    /// entries, so progress survives a crash.
    fn maybe_checkpoint(&mut self) -> Result<(), Error> {
        if self.last_checkpoint.elapsed() < self.options.checkpoint_interval {
            return Ok(());
        }
        self.last_checkpoint = Instant::now();

        let completed = self.completed_top.clone();
        let root_entry =
            self.encode_directory(completed, "/", 0o755, 0, 0, self.start_time, 0)?;

        let manifest = SnapshotManifest {
            id: None,
            source: self.source.clone().expect("source set before walking"),
            description: self.options.description.clone(),
            start_time: self.start_time,
            end_time: epoch_i64(),
            stats: self.stats.clone(),
            incomplete: Some(CHECKPOINT_REASON.to_string()),
            root_entry,
            retention_reasons: Vec::new(),
            tags: self.options.tags.clone(),
        };

        let id = self.repo.put_snapshot_manifest(&manifest)?;
        self.repo.flush()?;
        log::info!("wrote checkpoint manifest {}", id);
        self.checkpoints.push(id);
        Ok(())
    }
}
