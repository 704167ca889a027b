//! Index loss and recovery from pack trailers.

mod util;

use silo::blobstore::{list_blobs, BlobStore};
use silo::client::{create_snapshot, restore_snapshot, RestoreOptions};
use silo::tools::CancelToken;
use util::*;

#[test]
fn lost_indexes_are_rebuilt_from_packs() {
    let test = create_test_repo(b"recovery passphrase");
    let source = test.tmp.path().join("source");
    let mut rng = Rng::new(13);
    make_tree(&source, 2, 2, 3, 100, &mut rng);
    std::fs::write(source.join("chunky.bin"), rng.bytes(300 * 1024)).unwrap();

    let cancel = CancelToken::new();
    // several snapshots, so multiple index blobs exist
    let first = create_snapshot(&test.repo, &[source.clone()], &snapshot_options(), &cancel)
        .unwrap();
    std::fs::write(source.join("more.bin"), rng.bytes(100 * 1024)).unwrap();
    let second = create_snapshot(&test.repo, &[source.clone()], &snapshot_options(), &cancel)
        .unwrap();

    let contents_before = test.repo.content().live_content_count(None).unwrap();
    assert!(contents_before > 0);
    assert!(count_blobs(&test.store, "x") >= 2);

    // catastrophic loss of every index blob
    for blob in list_blobs(&*test.store, "x").unwrap() {
        test.store.delete(&blob.name).unwrap();
    }
    test.repo.content().refresh().unwrap();
    assert_eq!(test.repo.content().live_content_count(None).unwrap(), 0);

    // recover and commit
    let recovered = test.repo.content().recover_indexes(true).unwrap();
    assert_eq!(recovered, contents_before);
    assert!(count_blobs(&test.store, "x") >= 1);

    // both snapshots restore again (manifest catalog reloads from the
    // recovered contents)
    test.repo.refresh().unwrap();
    let target = test.tmp.path().join("restored");
    restore_snapshot(
        &test.repo,
        &second.manifest_id,
        &target,
        &RestoreOptions::default(),
        &cancel,
    )
    .unwrap();
    assert_eq!(tree_digest(&source), tree_digest(&target));

    std::fs::remove_file(source.join("more.bin")).unwrap();
    let target_first = test.tmp.path().join("restored-first");
    restore_snapshot(
        &test.repo,
        &first.manifest_id,
        &target_first,
        &RestoreOptions::default(),
        &cancel,
    )
    .unwrap();
    assert_eq!(tree_digest(&source), tree_digest(&target_first));

    // a fresh client sees the recovered state too
    let reopened = reopen(&test, b"recovery passphrase");
    assert_eq!(
        reopened.content().live_content_count(None).unwrap(),
        contents_before
    );
}

#[test]
fn recovery_without_commit_is_a_dry_run() {
    let test = create_test_repo(b"recovery passphrase");
    let source = test.tmp.path().join("source");
    let mut rng = Rng::new(14);
    make_tree(&source, 1, 1, 2, 100, &mut rng);

    let cancel = CancelToken::new();
    create_snapshot(&test.repo, &[source], &snapshot_options(), &cancel).unwrap();
    let contents_before = test.repo.content().live_content_count(None).unwrap();

    for blob in list_blobs(&*test.store, "x").unwrap() {
        test.store.delete(&blob.name).unwrap();
    }
    test.repo.content().refresh().unwrap();

    let recovered = test.repo.content().recover_indexes(false).unwrap();
    assert_eq!(recovered, contents_before);

    // nothing was written back
    assert_eq!(count_blobs(&test.store, "x"), 0);
    assert_eq!(test.repo.content().live_content_count(None).unwrap(), 0);
}
