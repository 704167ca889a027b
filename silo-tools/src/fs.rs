//! Small filesystem helpers: atomic file replacement and whole-file
//! reads.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, format_err, Error};

/// Atomically replace the contents of `path`: write to a temporary file
/// in the same directory, optionally fsync, then rename over the target.
pub fn replace_file<P: AsRef<Path>>(path: P, data: &[u8], fsync: bool) -> Result<(), Error> {
    let path = path.as_ref();

    let file_name = path
        .file_name()
        .ok_or_else(|| format_err!("replace_file: invalid path {:?}", path))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tmp_name = file_name.to_owned();
    tmp_name.push(format!(".tmp_{}", std::process::id()));
    let tmp_path = dir.join(tmp_name);

    let result = (|| -> Result<(), Error> {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        if fsync {
            file.sync_all()?;
        }
        drop(file);
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp_path);
    }

    result.map_err(|err| format_err!("unable to replace file {:?} - {}", path, err))
}

/// Read a whole file into memory.
pub fn file_get_contents<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, Error> {
    let path = path.as_ref();
    std::fs::read(path).map_err(|err| format_err!("unable to read {:?} - {}", path, err))
}

/// Create a directory (and parents) if missing; fail if the path exists
/// but is not a directory.
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let path = path.as_ref();
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => bail!("path {:?} exists but is not a directory", path),
        Err(_) => {
            std::fs::create_dir_all(path)
                .map_err(|err| format_err!("unable to create {:?} - {}", path, err))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replace_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        replace_file(&path, b"first", false).unwrap();
        assert_eq!(file_get_contents(&path).unwrap(), b"first");

        replace_file(&path, b"second", true).unwrap();
        assert_eq!(file_get_contents(&path).unwrap(), b"second");

        // no stray temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
