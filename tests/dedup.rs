//! Deduplication across snapshots.

mod util;

use silo::client::create_snapshot;
use silo::tools::CancelToken;
use util::*;

#[test]
fn unchanged_source_dedups_completely() {
    let test = create_test_repo(b"dedup passphrase");
    let source = test.tmp.path().join("source");
    let mut rng = Rng::new(42);
    // a couple of chunked files so data packs actually exist
    make_tree(&source, 2, 3, 4, 100, &mut rng);
    std::fs::write(source.join("big-0.bin"), rng.bytes(300 * 1024)).unwrap();
    std::fs::write(source.join("big-1.bin"), rng.bytes(300 * 1024)).unwrap();

    let cancel = CancelToken::new();
    let first = create_snapshot(&test.repo, &[source.clone()], &snapshot_options(), &cancel)
        .unwrap();

    let packs_after_first = count_blobs(&test.store, "p");
    assert!(packs_after_first > 0, "expected data packs for chunked files");
    let contents_after_first = test.repo.content().live_content_count(None).unwrap();

    let second = create_snapshot(&test.repo, &[source.clone()], &snapshot_options(), &cancel)
        .unwrap();

    // identical tree, identical root object
    assert_eq!(first.manifest.root_entry.obj, second.manifest.root_entry.obj);
    // all file hashes were reused from the previous manifest
    assert_eq!(
        second.manifest.stats.cached_files,
        second.manifest.stats.total_file_count
    );
    assert_eq!(second.manifest.stats.non_cached_files, 0);

    // no new data packs, no new contents
    assert_eq!(count_blobs(&test.store, "p"), packs_after_first);
    assert_eq!(
        test.repo.content().live_content_count(None).unwrap(),
        contents_after_first
    );

    // but both manifests exist
    let listed = test
        .repo
        .list_snapshot_manifests(Some(&first.manifest.source))
        .unwrap();
    assert_eq!(listed.len(), 2);
}

#[test]
fn small_change_reuploads_only_the_change() {
    let test = create_test_repo(b"dedup passphrase");
    let source = test.tmp.path().join("source");
    let mut rng = Rng::new(17);
    make_tree(&source, 1, 2, 5, 2048, &mut rng);

    let cancel = CancelToken::new();
    let first = create_snapshot(&test.repo, &[source.clone()], &snapshot_options(), &cancel)
        .unwrap();

    // modify exactly one file (and keep its size)
    let victim = source.join("file-00.dat");
    let mut data = std::fs::read(&victim).unwrap();
    data[0] ^= 0xff;
    std::fs::write(&victim, &data).unwrap();

    let second = create_snapshot(&test.repo, &[source.clone()], &snapshot_options(), &cancel)
        .unwrap();

    assert_ne!(first.manifest.root_entry.obj, second.manifest.root_entry.obj);
    assert_eq!(second.manifest.stats.non_cached_files, 1);
    assert_eq!(
        second.manifest.stats.cached_files,
        second.manifest.stats.total_file_count - 1
    );
}
