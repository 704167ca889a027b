//! Archive restore outputs: tar, tar.gz and zip streams.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;

use silo_api_types::{DirEntry, EntryKind, RepoError};
use silo_datastore::maintenance::read_directory;
use silo_datastore::Repository;
use silo_tools::CancelToken;

use super::RestoreStats;

/// Output format, chosen by extension or explicitly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ArchiveFormat {
    Tar,
    TarGz,
    Zip,
}

impl ArchiveFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(ArchiveFormat::TarGz)
        } else if name.ends_with(".tar") {
            Some(ArchiveFormat::Tar)
        } else if name.ends_with(".zip") {
            Some(ArchiveFormat::Zip)
        } else {
            None
        }
    }
}

/// Stream a stored tree into an archive.
pub fn restore_to_archive<W: Write>(
    repo: &Repository,
    root: &DirEntry,
    writer: W,
    format: ArchiveFormat,
    cancel: &CancelToken,
) -> Result<RestoreStats, Error> {
    match format {
        ArchiveFormat::Tar => restore_to_tar(repo, root, writer, cancel),
        ArchiveFormat::TarGz => {
            let encoder = GzEncoder::new(writer, Compression::default());
            let mut stats = RestoreStats::default();
            let mut builder = tar::Builder::new(encoder);
            tar_directory(repo, root, PathBuf::new(), &mut builder, cancel, &mut stats)?;
            builder.into_inner()?.finish()?;
            Ok(stats)
        }
        ArchiveFormat::Zip => restore_to_zip(repo, root, writer, cancel),
    }
}

fn restore_to_tar<W: Write>(
    repo: &Repository,
    root: &DirEntry,
    writer: W,
    cancel: &CancelToken,
) -> Result<RestoreStats, Error> {
    let mut stats = RestoreStats::default();
    let mut builder = tar::Builder::new(writer);
    tar_directory(repo, root, PathBuf::new(), &mut builder, cancel, &mut stats)?;
    builder.finish()?;
    Ok(stats)
}

fn tar_directory<W: Write>(
    repo: &Repository,
    entry: &DirEntry,
    prefix: PathBuf,
    builder: &mut tar::Builder<W>,
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
        let path = prefix.join(&child.name);

        match child.kind {
            EntryKind::Dir => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                fill_tar_header(&mut header, child);
                let mut dir_path = path.clone().into_os_string();
                dir_path.push("/");
                builder.append_data(&mut header, PathBuf::from(dir_path), std::io::empty())?;
                stats.restored_dirs += 1;

                tar_directory(repo, child, path, builder, cancel, stats)?;
            }
            EntryKind::File => {
                let child_object = child.obj.as_ref().ok_or_else(|| {
                    RepoError::Corrupt(format!("file '{}' has no object", child.name))
                })?;
                let mut reader = repo.objects().open_object(child_object)?;

                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(reader.len());
                fill_tar_header(&mut header, child);
                builder.append_data(&mut header, &path, &mut reader)?;

                stats.restored_files += 1;
                stats.restored_bytes += child.size;
            }
            EntryKind::Symlink => {
                let target = child.target.as_deref().ok_or_else(|| {
                    RepoError::Corrupt(format!("symlink '{}' has no target", child.name))
                })?;
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                fill_tar_header(&mut header, child);
                builder.append_link(&mut header, &path, target)?;
                stats.restored_symlinks += 1;
            }
            EntryKind::Error => {
                log::warn!("skipping error entry '{}' in archive", child.name);
                stats.skipped_entries += 1;
            }
        }
    }

    Ok(())
}

fn fill_tar_header(header: &mut tar::Header, entry: &DirEntry) {
    header.set_mode(entry.mode & 0o7777);
    header.set_uid(entry.uid as u64);
    header.set_gid(entry.gid as u64);
    header.set_mtime(entry.mtime.max(0) as u64);
}

// --- zip ---------------------------------------------------------------
//
// Minimal streaming zip writer: local headers with the data-descriptor
// flag, deflate compression, one central directory at the end. Sizes
// are 32 bit (no zip64), enough for archive exports of ordinary trees.

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;

const VERSION_NEEDED: u16 = 20;
const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
const METHOD_STORE: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

struct CountingWriter<W: Write> {
    inner: W,
    offset: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let count = self.inner.write(buf)?;
        self.offset += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct ZipEntry {
    name: String,
    method: u16,
    flags: u16,
    crc: u32,
    compressed: u64,
    uncompressed: u64,
    offset: u64,
    mode: u32,
    dos_time: u16,
    dos_date: u16,
}

/// MS-DOS date/time fields from an epoch timestamp (UTC).
fn dos_datetime(epoch: i64) -> (u16, u16) {
    // civil-from-days, Howard Hinnant's algorithm
    let secs_of_day = epoch.rem_euclid(86_400);
    let days = (epoch - secs_of_day) / 86_400;

    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };

    if year < 1980 {
        return (0x21, 0); // 1980-01-01
    }

    let date = (((year - 1980) as u16) << 9) | ((month as u16) << 5) | day as u16;
    let hour = secs_of_day / 3600;
    let minute = (secs_of_day % 3600) / 60;
    let second = secs_of_day % 60;
    let time = ((hour as u16) << 11) | ((minute as u16) << 5) | (second as u16 / 2);
    (date, time)
}

struct ZipWriter<W: Write> {
    out: CountingWriter<W>,
    entries: Vec<ZipEntry>,
}

impl<W: Write> ZipWriter<W> {
    fn new(writer: W) -> Self {
        Self {
            out: CountingWriter {
                inner: writer,
                offset: 0,
            },
            entries: Vec::new(),
        }
    }

    fn write_u16(&mut self, value: u16) -> Result<(), Error> {
        self.out.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    fn write_u32(&mut self, value: u32) -> Result<(), Error> {
        self.out.write_all(&value.to_le_bytes())?;
        Ok(())
    }

    fn local_header(&mut self, entry: &ZipEntry) -> Result<(), Error> {
        self.write_u32(LOCAL_HEADER_SIG)?;
        self.write_u16(VERSION_NEEDED)?;
        self.write_u16(entry.flags)?;
        self.write_u16(entry.method)?;
        self.write_u16(entry.dos_time)?;
        self.write_u16(entry.dos_date)?;
        self.write_u32(entry.crc)?;
        self.write_u32(entry.compressed as u32)?;
        self.write_u32(entry.uncompressed as u32)?;
        self.write_u16(entry.name.len() as u16)?;
        self.write_u16(0)?; // extra field
        self.out.write_all(entry.name.as_bytes())?;
        Ok(())
    }

    fn add_directory(&mut self, name: String, dir_entry: &DirEntry) -> Result<(), Error> {
        let (dos_date, dos_time) = dos_datetime(dir_entry.mtime);
        let entry = ZipEntry {
            name,
            method: METHOD_STORE,
            flags: 0,
            crc: 0,
            compressed: 0,
            uncompressed: 0,
            offset: self.out.offset,
            mode: 0o040_000 | (dir_entry.mode & 0o7777),
            dos_time,
            dos_date,
        };
        self.local_header(&entry)?;
        self.entries.push(entry);
        Ok(())
    }

    fn add_file(
        &mut self,
        name: String,
        dir_entry: &DirEntry,
        reader: &mut dyn Read,
    ) -> Result<u64, Error> {
        let (dos_date, dos_time) = dos_datetime(dir_entry.mtime);
        let offset = self.out.offset;

        let mut entry = ZipEntry {
            name,
            method: METHOD_DEFLATE,
            flags: FLAG_DATA_DESCRIPTOR,
            crc: 0,
            compressed: 0,
            uncompressed: 0,
            offset,
            mode: 0o100_000 | (dir_entry.mode & 0o7777),
            dos_time,
            dos_date,
        };
        self.local_header(&entry)?;

        let data_start = self.out.offset;
        let mut crc = crc32fast::Hasher::new();
        let mut uncompressed: u64 = 0;
        {
            let mut encoder = DeflateEncoder::new(&mut self.out, Compression::default());
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let count = reader.read(&mut buf)?;
                if count == 0 {
                    break;
                }
                crc.update(&buf[..count]);
                uncompressed += count as u64;
                encoder.write_all(&buf[..count])?;
            }
            encoder.finish()?;
        }

        entry.crc = crc.finalize();
        entry.compressed = self.out.offset - data_start;
        entry.uncompressed = uncompressed;

        if entry.compressed > u32::MAX as u64 || entry.uncompressed > u32::MAX as u64 {
            bail!("file too large for zip output");
        }

        // data descriptor
        self.write_u32(DESCRIPTOR_SIG)?;
        self.write_u32(entry.crc)?;
        self.write_u32(entry.compressed as u32)?;
        self.write_u32(entry.uncompressed as u32)?;

        let written = entry.uncompressed;
        self.entries.push(entry);
        Ok(written)
    }

    fn finish(mut self) -> Result<(), Error> {
        let central_start = self.out.offset;
        let entries = std::mem::take(&mut self.entries);

        for entry in &entries {
            self.write_u32(CENTRAL_SIG)?;
            self.write_u16(0x031e)?; // made by: unix, version 3.0
            self.write_u16(VERSION_NEEDED)?;
            self.write_u16(entry.flags)?;
            self.write_u16(entry.method)?;
            self.write_u16(entry.dos_time)?;
            self.write_u16(entry.dos_date)?;
            self.write_u32(entry.crc)?;
            self.write_u32(entry.compressed as u32)?;
            self.write_u32(entry.uncompressed as u32)?;
            self.write_u16(entry.name.len() as u16)?;
            self.write_u16(0)?; // extra
            self.write_u16(0)?; // comment
            self.write_u16(0)?; // disk number
            self.write_u16(0)?; // internal attributes
            self.write_u32(entry.mode << 16)?; // external attributes
            self.write_u32(entry.offset as u32)?;
            self.out.write_all(entry.name.as_bytes())?;
        }

        let central_size = self.out.offset - central_start;

        self.write_u32(EOCD_SIG)?;
        self.write_u16(0)?; // this disk
        self.write_u16(0)?; // central dir disk
        self.write_u16(entries.len() as u16)?;
        self.write_u16(entries.len() as u16)?;
        self.write_u32(central_size as u32)?;
        self.write_u32(central_start as u32)?;
        self.write_u16(0)?; // comment length

        self.out.flush()?;
        Ok(())
    }
}

fn restore_to_zip<W: Write>(
    repo: &Repository,
    root: &DirEntry,
    writer: W,
    cancel: &CancelToken,
) -> Result<RestoreStats, Error> {
    let mut stats = RestoreStats::default();
    let mut zip = ZipWriter::new(writer);
    zip_directory(repo, root, String::new(), &mut zip, cancel, &mut stats)?;
    zip.finish()?;
    Ok(stats)
}

fn zip_directory<W: Write>(
    repo: &Repository,
    entry: &DirEntry,
    prefix: String,
    zip: &mut ZipWriter<W>,
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
        let path = if prefix.is_empty() {
            child.name.clone()
        } else {
            format!("{}/{}", prefix, child.name)
        };

        match child.kind {
            EntryKind::Dir => {
                zip.add_directory(format!("{}/", path), child)?;
                stats.restored_dirs += 1;
                zip_directory(repo, child, path, zip, cancel, stats)?;
            }
            EntryKind::File => {
                let child_object = child.obj.as_ref().ok_or_else(|| {
                    RepoError::Corrupt(format!("file '{}' has no object", child.name))
                })?;
                let mut reader = repo
                    .objects()
                    .open_object(child_object)
                    .with_context(|| format!("opening '{}'", path))?;
                stats.restored_bytes += zip.add_file(path, child, &mut reader)?;
                stats.restored_files += 1;
            }
            EntryKind::Symlink => {
                // zip has no first-class symlinks; store the target text
                // with the link mode in the external attributes
                let target = child.target.as_deref().unwrap_or("");
                let mut reader = target.as_bytes();
                let mut link_entry = child.clone();
                link_entry.mode = 0o777;
                let saved = zip.add_file(path, &link_entry, &mut reader)?;
                let index = zip.entries.len() - 1;
                zip.entries[index].mode = 0o120_000 | 0o777;
                stats.restored_bytes += saved;
                stats.restored_symlinks += 1;
            }
            EntryKind::Error => {
                log::warn!("skipping error entry '{}' in archive", child.name);
                stats.skipped_entries += 1;
            }
        }
    }

    Ok(())
}
