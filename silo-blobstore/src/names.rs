//! Blob name layout.
//!
//! | Prefix | Contents |
//! |---|---|
//! | `silo.repository.f` | format blob |
//! | `silo.blobcfg` | blob-level retention config |
//! | `p<random>` | data pack |
//! | `q<random>` | metadata pack |
//! | `x<epoch>-<random>` | index blob |
//! | `s<random>` | session marker |
//! | `log/<date>/<name>` | diagnostic logs |

use anyhow::{bail, Error};
use lazy_static::lazy_static;
use regex::Regex;

pub const FORMAT_BLOB_NAME: &str = "silo.repository.f";
pub const BLOB_CFG_NAME: &str = "silo.blobcfg";

pub const DATA_PACK_PREFIX: &str = "p";
pub const META_PACK_PREFIX: &str = "q";
pub const INDEX_PREFIX: &str = "x";
pub const SESSION_PREFIX: &str = "s";
pub const LOG_PREFIX: &str = "log/";

const SUFFIX_LEN: usize = 16;
pub const MAX_BLOB_NAME_LEN: usize = 256;

lazy_static! {
    static ref INDEX_NAME: Regex = Regex::new(r"^x(\d{8})-[0-9a-f]{16}$").unwrap();
    static ref PACK_NAME: Regex = Regex::new(r"^[pq][0-9a-f]{16}$").unwrap();
    static ref SESSION_NAME: Regex = Regex::new(r"^s[0-9a-f]{16}$").unwrap();
}

/// 16 hex characters of fresh randomness.
pub fn random_suffix() -> String {
    let mut bytes = [0u8; SUFFIX_LEN / 2];
    openssl::rand::rand_bytes(&mut bytes).expect("rng failure");
    hex::encode(bytes)
}

pub fn new_pack_name(metadata: bool) -> String {
    let prefix = if metadata {
        META_PACK_PREFIX
    } else {
        DATA_PACK_PREFIX
    };
    format!("{}{}", prefix, random_suffix())
}

pub fn new_index_name(epoch: u32) -> String {
    format!("{}{:08}-{}", INDEX_PREFIX, epoch, random_suffix())
}

pub fn new_session_name() -> String {
    format!("{}{}", SESSION_PREFIX, random_suffix())
}

/// Name for a diagnostic log blob, grouped by day.
pub fn new_log_name(epoch: i64, kind: &str) -> String {
    let (year, month, day) = silo_tools::time::epoch_to_civil(epoch);
    format!(
        "{}{:04}-{:02}-{:02}/{}-{}",
        LOG_PREFIX,
        year,
        month,
        day,
        kind,
        random_suffix()
    )
}

/// Epoch number of an index blob, `None` for blobs that merely share the
/// `x` prefix.
pub fn parse_index_epoch(name: &str) -> Option<u32> {
    let captures = INDEX_NAME.captures(name)?;
    captures[1].parse().ok()
}

pub fn is_pack_name(name: &str) -> bool {
    PACK_NAME.is_match(name)
}

/// Session markers share their `s` prefix with the well-known repository
/// blobs, so listings must filter by shape, not prefix alone.
pub fn is_session_name(name: &str) -> bool {
    SESSION_NAME.is_match(name)
}

/// Validate a blob name against the backend contract (ASCII, bounded
/// length, conservative character set).
pub fn check_blob_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > MAX_BLOB_NAME_LEN {
        bail!("invalid blob name length {}", name.len());
    }
    for byte in name.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' | b'/' => (),
            _ => bail!("invalid character {:?} in blob name", byte as char),
        }
    }
    if name.starts_with('/') || name.contains("..") {
        bail!("invalid blob name '{}'", name);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn index_names_roundtrip() {
        let name = new_index_name(42);
        assert_eq!(parse_index_epoch(&name), Some(42));
        assert_eq!(parse_index_epoch("x0000001a"), None);
        assert_eq!(parse_index_epoch("p0123456789abcdef"), None);
    }

    #[test]
    fn session_shape_excludes_wellknown_blobs() {
        assert!(is_session_name(&new_session_name()));
        assert!(!is_session_name(FORMAT_BLOB_NAME));
        assert!(!is_session_name(BLOB_CFG_NAME));
    }

    #[test]
    fn pack_names() {
        assert!(is_pack_name(&new_pack_name(false)));
        assert!(is_pack_name(&new_pack_name(true)));
        assert!(!is_pack_name("x00000001-0123456789abcdef"));
    }

    #[test]
    fn log_names_are_valid_blob_names() {
        let name = new_log_name(1_700_000_000, "maintenance");
        assert!(name.starts_with("log/2023-11-14/maintenance-"));
        assert!(check_blob_name(&name).is_ok());
    }

    #[test]
    fn name_validation() {
        assert!(check_blob_name("log/2024-01-01/run.log").is_ok());
        assert!(check_blob_name("").is_err());
        assert!(check_blob_name("/abs").is_err());
        assert!(check_blob_name("a/../b").is_err());
        assert!(check_blob_name("bad name").is_err());
    }
}
