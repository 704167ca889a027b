//! Snapshot verification: walk a stored tree and prove every referenced
//! content is present and, optionally, that it still decodes.

use anyhow::Error;

use silo_api_types::{DirEntry, EntryKind, ManifestId, ObjectId};
use silo_datastore::maintenance::read_directory;
use silo_datastore::Repository;
use silo_tools::CancelToken;

#[derive(Clone, Copy, Default, Debug)]
pub struct VerifyOptions {
    /// Fetch and decode every content instead of only checking the
    /// index. Slower, but catches bit rot behind valid index entries.
    pub read_data: bool,
}

#[derive(Clone, Default, Debug)]
pub struct VerifyReport {
    pub verified_files: u64,
    pub verified_directories: u64,
    pub verified_contents: u64,
    /// One message per broken entry; empty means the snapshot is sound.
    pub errors: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Verify one snapshot by manifest id.
pub fn verify_snapshot(
    repo: &Repository,
    manifest_id: &ManifestId,
    options: &VerifyOptions,
    cancel: &CancelToken,
) -> Result<VerifyReport, Error> {
    let manifest = repo.get_snapshot_manifest(manifest_id)?;
    let mut report = VerifyReport::default();
    verify_entry(repo, &manifest.root_entry, String::new(), options, cancel, &mut report)?;
    Ok(report)
}

fn verify_object(
    repo: &Repository,
    object_id: &ObjectId,
    path: &str,
    options: &VerifyOptions,
    report: &mut VerifyReport,
) {
    match repo.objects().verify_object(object_id) {
        Ok(ids) => {
            report.verified_contents += ids.len() as u64;
            if options.read_data {
                for id in ids {
                    if let Err(err) = repo.content().get_content(&id) {
                        report
                            .errors
                            .push(format!("{}: content {} unreadable: {:#}", path, id, err));
                    }
                }
            }
        }
        Err(err) => {
            report.errors.push(format!("{}: {:#}", path, err));
        }
    }
}

fn verify_entry(
    repo: &Repository,
    entry: &DirEntry,
    path: String,
    options: &VerifyOptions,
    cancel: &CancelToken,
    report: &mut VerifyReport,
) -> Result<(), Error> {
    cancel.check()?;

    match entry.kind {
        EntryKind::File => {
            match &entry.obj {
                Some(object_id) => verify_object(repo, object_id, &path, options, report),
                None => report.errors.push(format!("{}: file without object", path)),
            }
            report.verified_files += 1;
        }
        EntryKind::Dir => {
            let object_id = match &entry.obj {
                Some(object_id) => object_id,
                None => {
                    report
                        .errors
                        .push(format!("{}: directory without object", path));
                    return Ok(());
                }
            };
            verify_object(repo, object_id, &path, options, report);

            match read_directory(repo, object_id) {
                Ok(manifest) => {
                    for child in &manifest.entries {
                        let child_path = if path.is_empty() {
                            child.name.clone()
                        } else {
                            format!("{}/{}", path, child.name)
                        };
                        verify_entry(repo, child, child_path, options, cancel, report)?;
                    }
                }
                Err(err) => {
                    report
                        .errors
                        .push(format!("{}: unreadable directory: {:#}", path, err));
                }
            }
            report.verified_directories += 1;
        }
        EntryKind::Symlink | EntryKind::Error => (),
    }

    Ok(())
}
