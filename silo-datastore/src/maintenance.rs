//! Repository maintenance: quick housekeeping and full mark-and-sweep
//! garbage collection.
//!
//! Quick mode compacts index blobs within closed epochs, rewrites
//! underfilled packs and sweeps stale session markers. Full mode
//! additionally walks every live snapshot manifest through the object
//! graph, revives referenced-but-tombstoned contents, tombstones
//! unreferenced contents older than the safety window, rewrites packs
//! whose live fraction dropped, and physically deletes blobs only after
//! both the tombstones and the blobs themselves aged out.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use silo_api_types::{
    ContentId, DirEntry, DirectoryManifest, EntryKind, MaintenanceStats, ObjectId, RepoError,
    MANIFEST_TYPE_LABEL, MANIFEST_TYPE_MAINTENANCE, NS_MANIFEST,
};
use silo_blobstore::names;
use silo_tools::time::epoch_i64;
use silo_tools::CancelToken;

use crate::epoch::{compact_epoch, write_index_blob, EpochView};
use crate::index::{CombinedIndex, IndexEntry};
use crate::repository::Repository;

/// Safety windows guarding physical deletion, seconds.
#[derive(Clone, Copy, Debug)]
pub struct SafetyParams {
    /// Minimum age before an unreferenced content may be tombstoned.
    pub min_content_age: i64,
    /// Minimum age before packs and index blobs may be deleted.
    pub blob_delete_age: i64,
    /// Age after which a session marker counts as stale.
    pub session_expire_age: i64,
}

/// Production safety: one day of grace everywhere.
pub const SAFETY_FULL: SafetyParams = SafetyParams {
    min_content_age: 24 * 3600,
    blob_delete_age: 24 * 3600,
    session_expire_age: 4 * 3600,
};

/// No safety windows. Tests and explicit `--safety=none` runs only.
pub const SAFETY_NONE: SafetyParams = SafetyParams {
    min_content_age: 0,
    blob_delete_age: 0,
    session_expire_age: 0,
};

#[derive(Clone, Debug)]
pub struct MaintenanceOptions {
    pub safety: SafetyParams,
    /// Rewrite packs whose live fraction fell below this.
    pub pack_rewrite_threshold: f64,
    /// Run full maintenance even when another identity owns it.
    pub force_ownership: bool,
}

impl Default for MaintenanceOptions {
    fn default() -> Self {
        Self {
            safety: SAFETY_FULL,
            pack_rewrite_threshold: 0.8,
            force_ownership: false,
        }
    }
}

/// Persisted cursor for maintenance, one record per repository
/// (`type=maintenance`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceSchedule {
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_quick_run: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_full_run: Option<i64>,
}

fn maintenance_labels() -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        MANIFEST_TYPE_LABEL.to_string(),
        MANIFEST_TYPE_MAINTENANCE.to_string(),
    );
    labels
}

/// Load the current schedule record, if any.
pub fn load_schedule(repo: &Repository) -> Result<Option<MaintenanceSchedule>, Error> {
    let manifests = repo.manifests();
    let records = manifests.find(&maintenance_labels());
    match records.last() {
        Some(record) => Ok(Some(
            serde_json::from_value(record.payload.clone())
                .map_err(|err| RepoError::Corrupt(format!("maintenance schedule - {}", err)))?,
        )),
        None => Ok(None),
    }
}

fn store_schedule(repo: &Repository, schedule: &MaintenanceSchedule) -> Result<(), Error> {
    let mut manifests = repo.manifests();
    let old: Vec<_> = manifests
        .find(&maintenance_labels())
        .iter()
        .map(|record| record.id.clone())
        .collect();
    for id in old {
        manifests.delete(&id)?;
    }
    manifests.put(maintenance_labels(), serde_json::to_value(schedule)?)?;
    Ok(())
}

/// Quick maintenance: epoch compaction, underfilled pack rewrite, stale
/// session sweep.
pub fn run_quick(
    repo: &Repository,
    options: &MaintenanceOptions,
    cancel: &CancelToken,
) -> Result<MaintenanceStats, Error> {
    let mut stats = MaintenanceStats::default();

    sweep_sessions(repo, &options.safety, &mut stats)?;
    compact_closed_epochs(repo, &options.safety, cancel, &mut stats)?;
    rewrite_packs(repo, options, cancel, &mut stats)?;
    delete_dead_packs(repo, options, cancel, &mut stats)?;

    let mut schedule = load_schedule(repo)?.unwrap_or_else(|| MaintenanceSchedule {
        owner: repo.identity().to_string(),
        last_quick_run: None,
        last_full_run: None,
    });
    schedule.last_quick_run = Some(epoch_i64());
    store_schedule(repo, &schedule)?;
    repo.flush()?;

    upload_run_log(repo, "maintenance-quick", &stats);

    Ok(stats)
}

/// Full maintenance: everything quick does, plus mark-and-sweep over
/// the object graph. Refuses to run when another identity owns the
/// maintenance schedule.
pub fn run_full(
    repo: &Repository,
    options: &MaintenanceOptions,
    cancel: &CancelToken,
) -> Result<MaintenanceStats, Error> {
    let schedule = load_schedule(repo)?;
    if let Some(schedule) = &schedule {
        if schedule.owner != repo.identity() && !options.force_ownership {
            return Err(RepoError::Unauthorized(format!(
                "maintenance is owned by '{}'",
                schedule.owner
            ))
            .into());
        }
    }

    let mut stats = MaintenanceStats::default();

    sweep_sessions(repo, &options.safety, &mut stats)?;
    compact_closed_epochs(repo, &options.safety, cancel, &mut stats)?;

    // phase 1: mark; referenced-but-tombstoned contents are revived on
    // the spot so the walk can read through them
    let reachable = mark_reachable(repo, cancel, &mut stats)?;
    log::info!("marked {} reachable contents", reachable.len());

    // phase 2: sweep content entries
    sweep_contents(repo, options, cancel, &reachable, &mut stats)?;
    repo.flush()?;

    // phase 3: rewrite underfilled packs, drop dead blobs, purge
    // tombstones whose packs are gone
    rewrite_packs(repo, options, cancel, &mut stats)?;
    let deleted_packs = delete_dead_packs(repo, options, cancel, &mut stats)?;
    purge_tombstones(repo, options, &deleted_packs, &mut stats)?;

    let mut schedule = schedule.unwrap_or_else(|| MaintenanceSchedule {
        owner: repo.identity().to_string(),
        last_quick_run: None,
        last_full_run: None,
    });
    schedule.last_full_run = Some(epoch_i64());
    store_schedule(repo, &schedule)?;
    repo.flush()?;

    upload_run_log(repo, "maintenance-full", &stats);

    log::info!(
        "maintenance done: {} in use ({} bytes), {} unused ({} bytes), {} system, {} too recent, {} undeleted",
        stats.in_use_count,
        stats.in_use_bytes,
        stats.unused_count,
        stats.unused_bytes,
        stats.system_count,
        stats.too_recent_count,
        stats.undeleted_count,
    );

    Ok(stats)
}

/// Persist a run report under the diagnostic log prefix. Best effort -
/// a failed log upload never fails the run.
fn upload_run_log(repo: &Repository, kind: &str, stats: &MaintenanceStats) {
    let report = match serde_json::to_vec_pretty(&serde_json::json!({
        "owner": repo.identity(),
        "time": epoch_i64(),
        "stats": stats,
    })) {
        Ok(report) => report,
        Err(_) => return,
    };

    let name = names::new_log_name(epoch_i64(), kind);
    if let Err(err) = repo
        .store()
        .put(&name, &report, &silo_blobstore::PutOptions::default())
    {
        log::warn!("unable to upload run log '{}': {}", name, err);
    }
}

fn sweep_sessions(
    repo: &Repository,
    safety: &SafetyParams,
    stats: &mut MaintenanceStats,
) -> Result<(), Error> {
    let now = epoch_i64();
    let mut stale = Vec::new();
    repo.store().list(names::SESSION_PREFIX, &mut |meta| {
        if names::is_session_name(&meta.name) && now - meta.mtime >= safety.session_expire_age {
            stale.push(meta.name);
        }
        Ok(())
    })?;

    for name in stale {
        match repo.store().delete(&name) {
            Ok(()) => stats.swept_sessions += 1,
            Err(err) if silo_api_types::is_not_found(&err) => (),
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn compact_closed_epochs(
    repo: &Repository,
    safety: &SafetyParams,
    cancel: &CancelToken,
    stats: &mut MaintenanceStats,
) -> Result<(), Error> {
    let store = repo.store();
    let view = EpochView::scan(store.as_ref())?;
    let now = epoch_i64();
    let epoch_options = repo.content().epoch_options();

    for epoch in view.closed_epochs(epoch_options, now) {
        cancel.check()?;
        stats.compacted_index_blobs += compact_epoch(
            store.as_ref(),
            repo.crypt(),
            &view,
            epoch,
            safety.blob_delete_age,
            cancel,
        )?;
    }
    Ok(())
}

/// Collect every content referenced from any live snapshot manifest.
fn mark_reachable(
    repo: &Repository,
    cancel: &CancelToken,
    stats: &mut MaintenanceStats,
) -> Result<HashSet<ContentId>, Error> {
    let snapshots = repo.list_snapshot_manifests(None)?;
    let mut reachable = HashSet::new();

    for manifest in snapshots {
        cancel.check()?;
        mark_entry(repo, &manifest.root_entry, &mut reachable, stats, cancel).with_context(|| {
            format!(
                "marking snapshot {} of {}",
                manifest
                    .id
                    .as_ref()
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "?".to_string()),
                manifest.source
            )
        })?;
    }

    Ok(reachable)
}

fn mark_entry(
    repo: &Repository,
    entry: &DirEntry,
    reachable: &mut HashSet<ContentId>,
    stats: &mut MaintenanceStats,
    cancel: &CancelToken,
) -> Result<(), Error> {
    cancel.check()?;

    let object_id = match &entry.obj {
        Some(object_id) => object_id,
        None => return Ok(()),
    };

    match entry.kind {
        EntryKind::File => mark_object(repo, object_id, reachable, stats),
        EntryKind::Dir => {
            mark_object(repo, object_id, reachable, stats)?;
            let manifest = read_directory(repo, object_id)?;
            for child in &manifest.entries {
                mark_entry(repo, child, reachable, stats, cancel)?;
            }
            Ok(())
        }
        EntryKind::Symlink | EntryKind::Error => Ok(()),
    }
}

/// Mark a referenced content, undeleting it first when a tombstone
/// shadows it. Fails loudly when the bytes are already gone.
fn ensure_live_and_mark(
    repo: &Repository,
    content_id: &ContentId,
    reachable: &mut HashSet<ContentId>,
    stats: &mut MaintenanceStats,
) -> Result<bool, Error> {
    if !reachable.insert(*content_id) {
        return Ok(false); // already visited
    }

    if let Some(entry) = repo.content().best_entry(content_id) {
        if entry.deleted {
            repo.content()
                .undelete_content(content_id)
                .with_context(|| format!("undeleting referenced content {}", content_id))?;
            stats.undeleted_count += 1;
            stats.undeleted_bytes += entry.length as u64;
        }
    }

    Ok(true)
}

fn mark_object(
    repo: &Repository,
    object_id: &ObjectId,
    reachable: &mut HashSet<ContentId>,
    stats: &mut MaintenanceStats,
) -> Result<(), Error> {
    match object_id {
        ObjectId::Inline(_) => Ok(()),
        ObjectId::Direct(content_id) => {
            ensure_live_and_mark(repo, content_id, reachable, stats)?;
            Ok(())
        }
        ObjectId::Indirect(content_id) => {
            if !ensure_live_and_mark(repo, content_id, reachable, stats)? {
                return Ok(());
            }
            for child in repo.objects().indirect_children(content_id)? {
                mark_object(repo, &child, reachable, stats)?;
            }
            Ok(())
        }
    }
}

/// Decode a directory manifest object.
pub fn read_directory(repo: &Repository, object_id: &ObjectId) -> Result<DirectoryManifest, Error> {
    let data = repo.objects().read_object(object_id)?;
    serde_json::from_slice(&data)
        .map_err(|err| RepoError::Corrupt(format!("directory manifest - {}", err)).into())
}

fn sweep_contents(
    repo: &Repository,
    options: &MaintenanceOptions,
    cancel: &CancelToken,
    reachable: &HashSet<ContentId>,
    stats: &mut MaintenanceStats,
) -> Result<(), Error> {
    let now = epoch_i64();
    let mut entries: Vec<IndexEntry> = Vec::new();
    repo.content().iterate_contents(None, true, &mut |entry| {
        entries.push(entry.clone());
        Ok(())
    })?;

    for entry in entries {
        cancel.check()?;
        let bytes = entry.length as u64;

        if reachable.contains(&entry.id) {
            if entry.deleted {
                repo.content()
                    .undelete_content(&entry.id)
                    .with_context(|| format!("undeleting referenced content {}", entry.id))?;
                stats.undeleted_count += 1;
                stats.undeleted_bytes += bytes;
            } else {
                stats.in_use_count += 1;
                stats.in_use_bytes += bytes;
            }
            continue;
        }

        if entry.deleted {
            // already tombstoned, waiting for physical purge
            continue;
        }

        if entry.id.namespace() == NS_MANIFEST {
            // manifest store contents are system data, never swept here
            stats.system_count += 1;
            stats.system_bytes += bytes;
            continue;
        }

        if now - entry.timestamp_secs() < options.safety.min_content_age {
            stats.too_recent_count += 1;
            stats.too_recent_bytes += bytes;
            continue;
        }

        repo.content().delete_content(&entry.id)?;
        stats.unused_count += 1;
        stats.unused_bytes += bytes;
    }

    Ok(())
}

/// Per-pack usage from the authoritative index entries.
fn pack_usage(repo: &Repository) -> Result<HashMap<String, (u64, u64)>, Error> {
    // (live bytes, tombstone max age timestamp secs)
    let mut usage: HashMap<String, (u64, u64)> = HashMap::new();
    repo.content().iterate_contents(None, true, &mut |entry| {
        let slot = usage.entry(entry.pack.clone()).or_insert((0, 0));
        if entry.deleted {
            slot.1 = slot.1.max(entry.timestamp_secs() as u64);
        } else {
            slot.0 += entry.length as u64;
        }
        Ok(())
    })?;
    Ok(usage)
}

fn list_packs(repo: &Repository) -> Result<Vec<silo_blobstore::BlobMeta>, Error> {
    let mut packs = Vec::new();
    for prefix in [names::DATA_PACK_PREFIX, names::META_PACK_PREFIX] {
        repo.store().list(prefix, &mut |meta| {
            if names::is_pack_name(&meta.name) {
                packs.push(meta);
            }
            Ok(())
        })?;
    }
    Ok(packs)
}

/// Rewrite live contents out of packs whose live fraction fell below
/// the threshold.
fn rewrite_packs(
    repo: &Repository,
    options: &MaintenanceOptions,
    cancel: &CancelToken,
    stats: &mut MaintenanceStats,
) -> Result<(), Error> {
    let now = epoch_i64();
    let usage = pack_usage(repo)?;
    let mut rewritten = 0u64;

    for pack in list_packs(repo)? {
        cancel.check()?;

        let (live_bytes, _) = usage.get(&pack.name).copied().unwrap_or((0, 0));
        if live_bytes == 0 || pack.size == 0 {
            continue; // dead packs are handled by deletion
        }
        let fraction = live_bytes as f64 / pack.size as f64;
        if fraction >= options.pack_rewrite_threshold {
            continue;
        }
        if now - pack.mtime < options.safety.blob_delete_age {
            continue;
        }

        log::info!(
            "rewriting pack '{}' (live fraction {:.2})",
            pack.name,
            fraction
        );

        let mut ids = Vec::new();
        repo.content().iterate_contents(None, false, &mut |entry| {
            if entry.pack == pack.name {
                ids.push(entry.id);
            }
            Ok(())
        })?;
        for id in ids {
            cancel.check()?;
            repo.content()
                .rewrite_content(&id)
                .with_context(|| format!("rewriting content {} from pack '{}'", id, pack.name))?;
        }
        rewritten += 1;
    }

    if rewritten > 0 {
        repo.flush()?;
    }
    stats.rewritten_packs += rewritten;
    Ok(())
}

/// Delete packs no live entry references, once the pack and the
/// tombstones pointing into it aged beyond the safety window.
fn delete_dead_packs(
    repo: &Repository,
    options: &MaintenanceOptions,
    cancel: &CancelToken,
    stats: &mut MaintenanceStats,
) -> Result<HashSet<String>, Error> {
    let now = epoch_i64();
    let usage = pack_usage(repo)?;
    let mut deleted = HashSet::new();

    for pack in list_packs(repo)? {
        cancel.check()?;

        let (live_bytes, youngest_tombstone) = usage.get(&pack.name).copied().unwrap_or((0, 0));
        if live_bytes > 0 {
            continue;
        }
        if now - pack.mtime < options.safety.blob_delete_age {
            continue;
        }
        if youngest_tombstone > 0
            && now - (youngest_tombstone as i64) < options.safety.blob_delete_age
        {
            continue;
        }

        match repo.store().delete(&pack.name) {
            Ok(()) => {
                log::info!("deleted dead pack '{}'", pack.name);
                stats.deleted_blobs += 1;
                deleted.insert(pack.name);
            }
            Err(err) if silo_api_types::is_not_found(&err) => (),
            Err(err) => return Err(err),
        }
    }

    Ok(deleted)
}

/// Drop tombstones whose packs are gone by rewriting the whole index
/// into a single fresh blob and deleting the aged old ones.
fn purge_tombstones(
    repo: &Repository,
    options: &MaintenanceOptions,
    deleted_packs: &HashSet<String>,
    stats: &mut MaintenanceStats,
) -> Result<(), Error> {
    let store = repo.store();
    let view = EpochView::scan(store.as_ref())?;
    let index_blob_count = view.all_blobs().count();

    let mut purged = 0u64;
    let mut retained = CombinedIndex::new();
    for entry in repo.content().committed_snapshot() {
        if entry.deleted && deleted_packs.contains(&entry.pack) {
            purged += 1;
            continue;
        }
        retained.merge_entry(entry);
    }

    if purged == 0 && index_blob_count <= 1 {
        return Ok(());
    }

    let now = epoch_i64();
    let epoch = view.write_epoch(repo.content().epoch_options(), now);
    let entries = retained.all_entries();
    if !entries.is_empty() {
        write_index_blob(store.as_ref(), repo.crypt(), epoch, &entries)?;
    }

    for meta in view.all_blobs() {
        if now - meta.mtime < options.safety.blob_delete_age {
            continue;
        }
        match store.delete(&meta.name) {
            Ok(()) => stats.compacted_index_blobs += 1,
            Err(err) if silo_api_types::is_not_found(&err) => (),
            Err(err) => return Err(err),
        }
    }

    repo.content().replace_committed(retained);
    log::debug!("purged {} tombstones", purged);
    Ok(())
}
