//! Repository format blob and key derivation.
//!
//! A single well-known blob (`silo.repository.f`) describes the
//! repository: algorithm identifiers, splitter parameters, a KDF
//! configuration and the sealed master key. Opening a repository
//! stretches the caller's passphrase, unseals the master key and derives
//! the working subkeys.

use anyhow::{bail, format_err, Context, Error};
use serde::{Deserialize, Serialize};

use silo_api_types::{RepoError, RepositoryStatus};
use silo_tools::serde_helpers::bytes_as_base64;
use silo_tools::time::epoch_i64;
use silo_tools::CryptConfig;

mod blob_config;
pub use blob_config::BlobRetentionConfig;

/// Current repository format version.
pub const FORMAT_VERSION: u32 = 1;

pub const HASH_HMAC_SHA256: &str = "hmac-sha256";
pub const ENCRYPTION_AES_256_GCM: &str = "aes-256-gcm";

/// Default content-defined splitter bounds (bytes).
pub const DEFAULT_SPLITTER_MIN: u32 = 64 * 1024;
pub const DEFAULT_SPLITTER_AVG: u32 = 256 * 1024;
pub const DEFAULT_SPLITTER_MAX: u32 = 1024 * 1024;

/// Key derivation function configuration.
///
/// The algorithm id is part of the persisted format blob. `argon2id` is a
/// recognized id reserved by the format, but this implementation does not
/// provide it and rejects such repositories with `UnknownAlgorithm`.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(tag = "algorithm")]
pub enum KeyDerivationConfig {
    #[serde(rename = "scrypt")]
    Scrypt {
        n: u64,
        r: u64,
        p: u64,
        #[serde(with = "bytes_as_base64")]
        salt: Vec<u8>,
    },
    #[serde(rename = "pbkdf2-sha256")]
    Pbkdf2Sha256 {
        iterations: usize,
        #[serde(with = "bytes_as_base64")]
        salt: Vec<u8>,
    },
    #[serde(rename = "argon2id")]
    Argon2id {
        memory_kib: u32,
        iterations: u32,
        parallelism: u32,
        #[serde(with = "bytes_as_base64")]
        salt: Vec<u8>,
    },
}

/// Which KDF to use when creating a repository.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Kdf {
    Scrypt,
    Pbkdf2Sha256,
}

impl KeyDerivationConfig {
    /// Build a fresh configuration with default cost parameters and a
    /// random salt.
    pub fn new(kdf: Kdf) -> Result<Self, Error> {
        let mut salt = vec![0u8; 32];
        openssl::rand::rand_bytes(&mut salt)?;

        Ok(match kdf {
            Kdf::Scrypt => KeyDerivationConfig::Scrypt {
                n: 65536,
                r: 8,
                p: 1,
                salt,
            },
            Kdf::Pbkdf2Sha256 => KeyDerivationConfig::Pbkdf2Sha256 {
                iterations: 100_000,
                salt,
            },
        })
    }

    /// Stretch a passphrase into a 32 byte key.
    pub fn derive_key(&self, passphrase: &[u8]) -> Result<[u8; 32], Error> {
        let mut key = [0u8; 32];

        match self {
            KeyDerivationConfig::Scrypt { n, r, p, salt } => {
                // estimated scrypt memory usage is 128*r*n*p
                openssl::pkcs5::scrypt(passphrase, salt, *n, *r, *p, 1025 * 1024 * 1024, &mut key)?;
                Ok(key)
            }
            KeyDerivationConfig::Pbkdf2Sha256 { iterations, salt } => {
                openssl::pkcs5::pbkdf2_hmac(
                    passphrase,
                    salt,
                    *iterations,
                    openssl::hash::MessageDigest::sha256(),
                    &mut key,
                )?;
                Ok(key)
            }
            KeyDerivationConfig::Argon2id { .. } => {
                Err(RepoError::UnknownAlgorithm("argon2id".to_string()).into())
            }
        }
    }
}

/// The master key, AES-GCM sealed under the stretched passphrase.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct SealedKey {
    #[serde(with = "bytes_as_base64")]
    pub iv: Vec<u8>,
    #[serde(with = "bytes_as_base64")]
    pub tag: Vec<u8>,
    #[serde(with = "bytes_as_base64")]
    pub data: Vec<u8>,
}

/// The repository format descriptor persisted as `silo.repository.f`.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct RepositoryFormat {
    pub version: u32,
    /// Random id distinguishing repositories.
    pub unique_id: String,
    pub hash: String,
    pub encryption: String,
    /// Compress contents by default.
    pub compression: bool,
    pub splitter_min: u32,
    pub splitter_avg: u32,
    pub splitter_max: u32,
    pub created: i64,
    pub kdf: KeyDerivationConfig,
    pub sealed_key: SealedKey,
    /// Set when the repository was created without a format recovery
    /// copy in its first data pack.
    #[serde(default)]
    pub deny_format_recovery: bool,
}

/// Options for [`RepositoryFormat::create`].
#[derive(Clone, Debug)]
pub struct FormatCreateOptions {
    pub kdf: Kdf,
    pub compression: bool,
    pub splitter_min: u32,
    pub splitter_avg: u32,
    pub splitter_max: u32,
    pub deny_format_recovery: bool,
}

impl Default for FormatCreateOptions {
    fn default() -> Self {
        Self {
            kdf: Kdf::Scrypt,
            compression: true,
            splitter_min: DEFAULT_SPLITTER_MIN,
            splitter_avg: DEFAULT_SPLITTER_AVG,
            splitter_max: DEFAULT_SPLITTER_MAX,
            deny_format_recovery: false,
        }
    }
}

impl RepositoryFormat {
    /// Create a fresh format descriptor: random master key, sealed under
    /// the passphrase.
    pub fn create(passphrase: &[u8], options: FormatCreateOptions) -> Result<Self, Error> {
        if passphrase.len() < 5 {
            bail!("passphrase is too short");
        }
        if options.splitter_avg.count_ones() != 1 {
            bail!("splitter average must be a power of two");
        }
        if options.splitter_min > options.splitter_avg
            || options.splitter_avg > options.splitter_max
        {
            bail!("splitter bounds out of order");
        }

        let mut master_key = [0u8; 32];
        openssl::rand::rand_bytes(&mut master_key)?;

        let mut unique_id = [0u8; 16];
        openssl::rand::rand_bytes(&mut unique_id)?;

        let kdf = KeyDerivationConfig::new(options.kdf)?;
        let stretched = kdf.derive_key(passphrase)?;

        let cipher = openssl::symm::Cipher::aes_256_gcm();
        let mut iv = vec![0u8; 16];
        openssl::rand::rand_bytes(&mut iv)?;
        let mut tag = vec![0u8; 16];
        let data =
            openssl::symm::encrypt_aead(cipher, &stretched, Some(&iv), b"", &master_key, &mut tag)?;

        Ok(Self {
            version: FORMAT_VERSION,
            unique_id: hex::encode(unique_id),
            hash: HASH_HMAC_SHA256.to_string(),
            encryption: ENCRYPTION_AES_256_GCM.to_string(),
            compression: options.compression,
            splitter_min: options.splitter_min,
            splitter_avg: options.splitter_avg,
            splitter_max: options.splitter_max,
            created: epoch_i64(),
            kdf,
            sealed_key: SealedKey { iv, tag, data },
            deny_format_recovery: options.deny_format_recovery,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        let format: Self = serde_json::from_slice(data)
            .map_err(|err| RepoError::Corrupt(format!("unparseable format blob - {}", err)))?;
        if format.version != FORMAT_VERSION {
            return Err(RepoError::Corrupt(format!(
                "unsupported format version {}",
                format.version
            ))
            .into());
        }
        Ok(format)
    }

    /// Unseal the master key and derive the working crypto state.
    pub fn open(&self, passphrase: &[u8]) -> Result<CryptConfig, Error> {
        if self.hash != HASH_HMAC_SHA256 {
            return Err(RepoError::UnknownAlgorithm(self.hash.clone()).into());
        }
        if self.encryption != ENCRYPTION_AES_256_GCM {
            return Err(RepoError::UnknownAlgorithm(self.encryption.clone()).into());
        }

        let stretched = self.kdf.derive_key(passphrase)?;

        if self.sealed_key.iv.len() != 16 || self.sealed_key.tag.len() != 16 {
            return Err(RepoError::Corrupt("malformed sealed key".to_string()).into());
        }

        let cipher = openssl::symm::Cipher::aes_256_gcm();
        let master = openssl::symm::decrypt_aead(
            cipher,
            &stretched,
            Some(&self.sealed_key.iv),
            b"",
            &self.sealed_key.data,
            &self.sealed_key.tag,
        )
        .map_err(|_| RepoError::WrongPassphrase)?;

        let master_key: [u8; 32] = master
            .as_slice()
            .try_into()
            .map_err(|_| RepoError::Corrupt("sealed key has wrong size".to_string()))?;

        CryptConfig::new(master_key).context("deriving repository subkeys")
    }

    pub fn status(&self, read_only: bool) -> RepositoryStatus {
        RepositoryStatus {
            unique_id: self.unique_id.clone(),
            format_version: self.version,
            hash: self.hash.clone(),
            encryption: self.encryption.clone(),
            compression: self.compression,
            splitter_min: self.splitter_min,
            splitter_avg: self.splitter_avg,
            splitter_max: self.splitter_max,
            read_only,
        }
    }
}

/// Read `REPO_PASSWORD` from the environment.
pub fn passphrase_from_env() -> Result<Vec<u8>, Error> {
    match std::env::var("REPO_PASSWORD") {
        Ok(password) if !password.is_empty() => Ok(password.into_bytes()),
        _ => Err(format_err!(
            "no passphrase given and REPO_PASSWORD is not set"
        )),
    }
}
