//! The restore engine: materialize a stored tree to a local filesystem,
//! an archive stream, or a shallow placeholder layout.

pub mod archive;

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{bail, Context, Error};

use silo_api_types::{
    DirEntry, EntryKind, ManifestId, ObjectId, RepoError, SnapshotManifest,
};
use silo_datastore::maintenance::read_directory;
use silo_datastore::Repository;
use silo_tools::CancelToken;

use crate::snapshot::{PLACEHOLDER_DIR_MARKER, PLACEHOLDER_SUFFIX};

/// Zero runs of at least this many bytes become holes in sparse mode.
const SPARSE_BLOCK_SIZE: usize = 4096;

#[derive(Clone, Debug)]
pub struct RestoreOptions {
    pub overwrite_files: bool,
    pub overwrite_directories: bool,
    pub overwrite_symlinks: bool,
    /// Silently keep files that already exist.
    pub skip_existing: bool,
    pub skip_times: bool,
    pub skip_owners: bool,
    pub skip_permissions: bool,
    pub ignore_permission_errors: bool,
    pub write_sparse_files: bool,
    /// Entries deeper than this become `.silo-entry` placeholders.
    pub shallow_depth: Option<u32>,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            overwrite_files: true,
            overwrite_directories: true,
            overwrite_symlinks: true,
            skip_existing: false,
            skip_times: false,
            skip_owners: false,
            skip_permissions: false,
            ignore_permission_errors: false,
            write_sparse_files: false,
            shallow_depth: None,
        }
    }
}

#[derive(Clone, Default, Debug)]
pub struct RestoreStats {
    pub restored_files: u64,
    pub restored_dirs: u64,
    pub restored_symlinks: u64,
    pub restored_bytes: u64,
    pub skipped_entries: u64,
    pub placeholders_written: u64,
}

/// Find the root entry for a bare object id.
///
/// Multiple snapshot manifests may share the root object with different
/// top-level attributes; `consistent_attributes` turns that ambiguity
/// into an error, otherwise the latest manifest wins. Unknown roots get
/// synthetic default attributes.
pub fn resolve_root(
    repo: &Repository,
    object_id: &ObjectId,
    consistent_attributes: bool,
) -> Result<DirEntry, Error> {
    let snapshots = repo.list_snapshot_manifests(None)?;
    let mut matching: Vec<&SnapshotManifest> = snapshots
        .iter()
        .filter(|manifest| manifest.root_entry.obj.as_ref() == Some(object_id))
        .collect();

    if matching.is_empty() {
        return Ok(DirEntry {
            name: "/".to_string(),
            kind: EntryKind::Dir,
            mode: 0o755,
            uid: 0,
            gid: 0,
            size: 0,
            mtime: 0,
            mtime_ns: 0,
            obj: Some(object_id.clone()),
            target: None,
            error: None,
            summ: None,
        });
    }

    if consistent_attributes && matching.len() > 1 {
        let first = &matching[0].root_entry;
        let conflicting = matching.iter().skip(1).any(|manifest| {
            let entry = &manifest.root_entry;
            entry.mode != first.mode
                || entry.uid != first.uid
                || entry.gid != first.gid
                || entry.mtime != first.mtime
        });
        if conflicting {
            return Err(RepoError::Conflict(
                "snapshots disagree about root attributes".to_string(),
            )
            .into());
        }
    }

    matching.sort_by_key(|manifest| manifest.start_time);
    Ok(matching.last().unwrap().root_entry.clone())
}

/// Restore a snapshot (by manifest id) into a directory.
pub fn restore_snapshot(
    repo: &Repository,
    manifest_id: &ManifestId,
    target: &Path,
    options: &RestoreOptions,
    cancel: &CancelToken,
) -> Result<RestoreStats, Error> {
    let manifest = repo.get_snapshot_manifest(manifest_id)?;
    restore_to_directory(repo, &manifest.root_entry, target, options, cancel)
}

/// Restore a tree rooted at `entry` into `target`.
pub fn restore_to_directory(
    repo: &Repository,
    entry: &DirEntry,
    target: &Path,
    options: &RestoreOptions,
    cancel: &CancelToken,
) -> Result<RestoreStats, Error> {
    if entry.kind != EntryKind::Dir {
        bail!("restore root must be a directory entry");
    }

    std::fs::create_dir_all(target)
        .with_context(|| format!("unable to create restore target {:?}", target))?;

    let mut stats = RestoreStats::default();
    restore_dir_children(repo, entry, target, 0, options, cancel, &mut stats)?;
    apply_metadata(target, entry, options, false)?;
    Ok(stats)
}

fn restore_dir_children(
    repo: &Repository,
    entry: &DirEntry,
    path: &Path,
    depth: u32,
    options: &RestoreOptions,
    cancel: &CancelToken,
    stats: &mut RestoreStats,
) -> Result<(), Error> {
    cancel.check()?;

    let object_id = entry
        .obj
        .as_ref()
        .ok_or_else(|| RepoError::Corrupt(format!("directory '{}' has no object", entry.name)))?;
    let manifest = read_directory(repo, object_id)?;

    for child in &manifest.entries {
        cancel.check()?;

        if let Some(limit) = options.shallow_depth {
            if depth >= limit && child.kind != EntryKind::Error {
                write_placeholder(child, path, stats)?;
                continue;
            }
        }

        match child.kind {
            EntryKind::Dir => {
                let child_path = path.join(&child.name);
                match std::fs::symlink_metadata(&child_path) {
                    Ok(existing) if existing.is_dir() => {
                        if !options.overwrite_directories {
                            if options.skip_existing {
                                stats.skipped_entries += 1;
                                continue;
                            }
                            bail!("directory {:?} already exists", child_path);
                        }
                    }
                    Ok(_) => bail!("{:?} exists and is not a directory", child_path),
                    Err(_) => {
                        std::fs::create_dir(&child_path)
                            .with_context(|| format!("unable to create {:?}", child_path))?;
                    }
                }
                restore_dir_children(repo, child, &child_path, depth + 1, options, cancel, stats)?;
                apply_metadata(&child_path, child, options, false)?;
                stats.restored_dirs += 1;
            }
            EntryKind::File => {
                restore_file(repo, child, path, options, stats)?;
            }
            EntryKind::Symlink => {
                restore_symlink(child, path, options, stats)?;
            }
            EntryKind::Error => {
                log::warn!(
                    "skipping entry '{}' recorded with error: {}",
                    child.name,
                    child.error.as_deref().unwrap_or("unknown")
                );
                stats.skipped_entries += 1;
            }
        }
    }

    Ok(())
}

fn restore_file(
    repo: &Repository,
    entry: &DirEntry,
    parent: &Path,
    options: &RestoreOptions,
    stats: &mut RestoreStats,
) -> Result<(), Error> {
    let path = parent.join(&entry.name);

    if path.symlink_metadata().is_ok() {
        if options.skip_existing {
            stats.skipped_entries += 1;
            return Ok(());
        }
        if !options.overwrite_files {
            bail!("file {:?} already exists", path);
        }
    }

    let object_id = entry
        .obj
        .as_ref()
        .ok_or_else(|| RepoError::Corrupt(format!("file '{}' has no object", entry.name)))?;
    let mut reader = repo.objects().open_object(object_id)?;

    let mut file = std::fs::File::create(&path)
        .with_context(|| format!("unable to create {:?}", path))?;

    let written = if options.write_sparse_files {
        write_sparse(&mut reader, &mut file)?
    } else {
        std::io::copy(&mut reader, &mut file)?
    };

    drop(file);
    apply_metadata(&path, entry, options, false)?;

    stats.restored_files += 1;
    stats.restored_bytes += written;
    Ok(())
}

/// Copy a stream, turning zero runs into holes. The final length is
/// materialized with `set_len`, so trailing holes stay sparse.
fn write_sparse(reader: &mut dyn Read, file: &mut std::fs::File) -> Result<u64, Error> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut pos: u64 = 0;

    loop {
        let count = reader.read(&mut buf)?;
        if count == 0 {
            break;
        }

        let mut offset = 0;
        while offset < count {
            let block = SPARSE_BLOCK_SIZE.min(count - offset);
            let slice = &buf[offset..offset + block];
            if slice.iter().all(|&byte| byte == 0) {
                // leave a hole
                pos += block as u64;
            } else {
                file.seek(SeekFrom::Start(pos))?;
                file.write_all(slice)?;
                pos += block as u64;
            }
            offset += block;
        }
    }

    file.set_len(pos)?;
    Ok(pos)
}

fn restore_symlink(
    entry: &DirEntry,
    parent: &Path,
    options: &RestoreOptions,
    stats: &mut RestoreStats,
) -> Result<(), Error> {
    let path = parent.join(&entry.name);
    let target = entry
        .target
        .as_ref()
        .ok_or_else(|| RepoError::Corrupt(format!("symlink '{}' has no target", entry.name)))?;

    if path.symlink_metadata().is_ok() {
        if options.skip_existing {
            stats.skipped_entries += 1;
            return Ok(());
        }
        if !options.overwrite_symlinks {
            bail!("symlink {:?} already exists", path);
        }
        std::fs::remove_file(&path)?;
    }

    std::os::unix::fs::symlink(target, &path)
        .with_context(|| format!("unable to create symlink {:?}", path))?;
    apply_metadata(&path, entry, options, true)?;

    stats.restored_symlinks += 1;
    Ok(())
}

/// Write a shallow placeholder standing in for an unrestored entry.
fn write_placeholder(
    entry: &DirEntry,
    parent: &Path,
    stats: &mut RestoreStats,
) -> Result<(), Error> {
    let payload = serde_json::to_vec_pretty(entry)?;

    match entry.kind {
        EntryKind::Dir => {
            let dir_path = parent.join(format!("{}{}", entry.name, PLACEHOLDER_DIR_MARKER));
            std::fs::create_dir_all(&dir_path)?;
            std::fs::write(dir_path.join(PLACEHOLDER_DIR_MARKER), payload)?;
        }
        _ => {
            let file_path = parent.join(format!("{}{}", entry.name, PLACEHOLDER_SUFFIX));
            std::fs::write(file_path, payload)?;
        }
    }

    stats.placeholders_written += 1;
    Ok(())
}

fn apply_metadata(
    path: &Path,
    entry: &DirEntry,
    options: &RestoreOptions,
    symlink: bool,
) -> Result<(), Error> {
    let tolerate = |what: &str, err: Error| -> Result<(), Error> {
        if options.ignore_permission_errors {
            log::warn!("unable to restore {} of {:?}: {}", what, path, err);
            Ok(())
        } else {
            Err(err.context(format!("restoring {} of {:?}", what, path)))
        }
    };

    if !options.skip_permissions && !symlink {
        let permissions = std::fs::Permissions::from_mode(entry.mode & 0o7777);
        if let Err(err) = std::fs::set_permissions(path, permissions) {
            tolerate("permissions", err.into())?;
        }
    }

    if !options.skip_owners {
        let result = nix::unistd::fchownat(
            None,
            path,
            Some(nix::unistd::Uid::from_raw(entry.uid)),
            Some(nix::unistd::Gid::from_raw(entry.gid)),
            if symlink {
                nix::unistd::FchownatFlags::NoFollowSymlink
            } else {
                nix::unistd::FchownatFlags::FollowSymlink
            },
        );
        if let Err(err) = result {
            tolerate("owner", err.into())?;
        }
    }

    if !options.skip_times && entry.mtime != 0 {
        let timespec = nix::sys::time::TimeSpec::new(entry.mtime, entry.mtime_ns as i64);
        let result = nix::sys::stat::utimensat(
            None,
            path,
            &timespec,
            &timespec,
            nix::sys::stat::UtimensatFlags::NoFollowSymlink,
        );
        if let Err(err) = result {
            tolerate("times", err.into())?;
        }
    }

    Ok(())
}
