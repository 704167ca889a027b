//! Archive and shallow restore outputs.

mod util;

use std::io::Read;

use silo::client::restore::archive::ArchiveFormat;
use silo::client::{
    create_snapshot, restore_to_archive, restore_to_directory, RestoreOptions,
};
use silo::tools::CancelToken;
use util::*;

fn snapshot_small_tree(test: &TestRepo) -> silo::client::SnapshotResult {
    let source = test.tmp.path().join("source");
    std::fs::create_dir_all(source.join("docs")).unwrap();
    std::fs::write(source.join("readme.txt"), b"hello archive").unwrap();
    std::fs::write(source.join("docs").join("guide.md"), b"# guide\nbody\n").unwrap();
    std::os::unix::fs::symlink("readme.txt", source.join("link")).unwrap();

    let cancel = CancelToken::new();
    create_snapshot(&test.repo, &[source], &snapshot_options(), &cancel).unwrap()
}

#[test]
fn tar_output_roundtrips() {
    let test = create_test_repo(b"archive passphrase");
    let result = snapshot_small_tree(&test);
    let cancel = CancelToken::new();

    let mut tar_bytes = Vec::new();
    let stats = restore_to_archive(
        &test.repo,
        &result.manifest.root_entry,
        &mut tar_bytes,
        ArchiveFormat::Tar,
        &cancel,
    )
    .unwrap();
    assert_eq!(stats.restored_files, 2);
    assert_eq!(stats.restored_symlinks, 1);

    // read the stream back with the tar reader
    let mut archive = tar::Archive::new(&tar_bytes[..]);
    let mut seen = std::collections::BTreeMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().to_string_lossy().into_owned();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        seen.insert(path, data);
    }
    assert_eq!(seen["readme.txt"], b"hello archive");
    assert_eq!(seen["docs/guide.md"], b"# guide\nbody\n");
    assert!(seen.contains_key("docs/"));
    assert!(seen.contains_key("link"));
}

#[test]
fn tar_gz_output_is_gzip() {
    let test = create_test_repo(b"archive passphrase");
    let result = snapshot_small_tree(&test);
    let cancel = CancelToken::new();

    let mut bytes = Vec::new();
    restore_to_archive(
        &test.repo,
        &result.manifest.root_entry,
        &mut bytes,
        ArchiveFormat::TarGz,
        &cancel,
    )
    .unwrap();

    // gzip magic
    assert_eq!(&bytes[0..2], &[0x1f, 0x8b]);

    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(&bytes[..]));
    let names: Vec<String> = archive
        .entries()
        .unwrap()
        .map(|entry| {
            entry
                .unwrap()
                .path()
                .unwrap()
                .to_string_lossy()
                .into_owned()
        })
        .collect();
    assert!(names.contains(&"readme.txt".to_string()));
}

#[test]
fn zip_output_has_valid_structure() {
    let test = create_test_repo(b"archive passphrase");
    let result = snapshot_small_tree(&test);
    let cancel = CancelToken::new();

    let mut bytes = Vec::new();
    let stats = restore_to_archive(
        &test.repo,
        &result.manifest.root_entry,
        &mut bytes,
        ArchiveFormat::Zip,
        &cancel,
    )
    .unwrap();
    assert_eq!(stats.restored_files, 2);

    // local header at the start, end-of-central-directory at the end
    assert_eq!(&bytes[0..4], &[0x50, 0x4b, 0x03, 0x04]);
    let eocd = bytes.len() - 22;
    assert_eq!(&bytes[eocd..eocd + 4], &[0x50, 0x4b, 0x05, 0x06]);

    // entry names appear in the central directory
    let tail = String::from_utf8_lossy(&bytes[eocd.saturating_sub(512)..]);
    assert!(tail.contains("readme.txt"));
    assert!(tail.contains("docs/guide.md"));
}

#[test]
fn format_from_extension() {
    use std::path::Path;
    assert_eq!(
        ArchiveFormat::from_path(Path::new("backup.tar")),
        Some(ArchiveFormat::Tar)
    );
    assert_eq!(
        ArchiveFormat::from_path(Path::new("backup.tar.gz")),
        Some(ArchiveFormat::TarGz)
    );
    assert_eq!(
        ArchiveFormat::from_path(Path::new("backup.tgz")),
        Some(ArchiveFormat::TarGz)
    );
    assert_eq!(
        ArchiveFormat::from_path(Path::new("backup.zip")),
        Some(ArchiveFormat::Zip)
    );
    assert_eq!(ArchiveFormat::from_path(Path::new("backup.bin")), None);
}

#[test]
fn shallow_restore_and_reinline() {
    let test = create_test_repo(b"archive passphrase");
    let source = test.tmp.path().join("source");
    let mut rng = Rng::new(21);
    make_tree(&source, 1, 3, 2, 100, &mut rng);

    let cancel = CancelToken::new();
    let original =
        create_snapshot(&test.repo, &[source], &snapshot_options(), &cancel).unwrap();

    // shallow restore: top-level children materialize, everything below
    // becomes placeholders
    let target = test.tmp.path().join("shallow");
    let options = RestoreOptions {
        shallow_depth: Some(1),
        ..Default::default()
    };
    let stats = restore_to_directory(
        &test.repo,
        &original.manifest.root_entry,
        &target,
        &options,
        &cancel,
    )
    .unwrap();
    assert!(stats.placeholders_written > 0);
    assert!(target.join("dir-00").is_dir());
    assert!(target
        .join("dir-00")
        .join("file-00.dat.silo-entry")
        .is_file());

    // snapshotting the shallow layout re-inlines the placeholders and
    // reproduces the original root object
    let resnap = create_snapshot(&test.repo, &[target], &snapshot_options(), &cancel).unwrap();
    assert_eq!(
        resnap.manifest.root_entry.obj,
        original.manifest.root_entry.obj
    );
}
