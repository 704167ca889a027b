//! Repository crypto configuration.
//!
//! All repository keys derive from a single 32 byte master key. Contents
//! are encrypted with AES-256-GCM and addressed by an HMAC-SHA-256 digest
//! computed under a separate subkey, so content ids from different
//! repositories never collide and reveal nothing without the key.

use anyhow::Error;
use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::pkey::{PKey, Private};
use openssl::symm::{Cipher, Crypter, Mode};

/// Iterations for the cheap domain-separation stretch of the subkeys.
/// The expensive passphrase stretch already happened when the master key
/// was unsealed.
const SUBKEY_ITERATIONS: usize = 10;

/// Size of the per-content IV.
pub const IV_SIZE: usize = 16;

/// Size of the GCM authentication tag.
pub const TAG_SIZE: usize = 16;

/// Crypto state derived from the repository master key.
pub struct CryptConfig {
    cipher: Cipher,
    // subkey providing the content digest name space
    id_pkey: PKey<Private>,
    // subkey for deterministic per-content IV derivation
    nonce_pkey: PKey<Private>,
    // subkey used by the cipher
    enc_key: [u8; 32],
}

fn derive_subkey(master_key: &[u8; 32], domain: &[u8]) -> Result<[u8; 32], Error> {
    let mut key = [0u8; 32];
    pbkdf2_hmac(
        master_key,
        domain,
        SUBKEY_ITERATIONS,
        MessageDigest::sha256(),
        &mut key,
    )?;
    Ok(key)
}

impl CryptConfig {
    pub fn new(master_key: [u8; 32]) -> Result<Self, Error> {
        let id_key = derive_subkey(&master_key, b"_id_key")?;
        let nonce_key = derive_subkey(&master_key, b"_nonce_key")?;
        let enc_key = derive_subkey(&master_key, b"_enc_key")?;

        let id_pkey = PKey::hmac(&id_key)?;
        let nonce_pkey = PKey::hmac(&nonce_key)?;

        Ok(Self {
            cipher: Cipher::aes_256_gcm(),
            id_pkey,
            nonce_pkey,
            enc_key,
        })
    }

    /// Expose the cipher (AES-256-GCM).
    pub fn cipher(&self) -> &Cipher {
        &self.cipher
    }

    /// Expose the content encryption subkey.
    pub fn enc_key(&self) -> &[u8; 32] {
        &self.enc_key
    }

    /// Compute a content digest: HMAC-SHA-256 of the plaintext under the
    /// id subkey.
    pub fn compute_digest(&self, data: &[u8]) -> [u8; 32] {
        self.hmac(&self.id_pkey, data)
    }

    /// Derive the deterministic IV for a content from its id bytes.
    pub fn derive_nonce(&self, id_bytes: &[u8]) -> [u8; IV_SIZE] {
        let mac = self.hmac(&self.nonce_pkey, id_bytes);
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&mac[..IV_SIZE]);
        iv
    }

    /// Compute an authentication tag (HMAC-SHA-256) over arbitrary data,
    /// e.g. manifest signatures.
    pub fn compute_auth_tag(&self, data: &[u8]) -> [u8; 32] {
        self.hmac(&self.id_pkey, data)
    }

    /// A digest identifying the key set without revealing it.
    pub fn fingerprint(&self) -> [u8; 32] {
        let input = openssl::sha::sha256(b"silo repository key fingerprint");
        self.compute_digest(&input)
    }

    /// Returns an AES-256-GCM crypter for the given IV and direction.
    pub fn data_crypter(&self, iv: &[u8; IV_SIZE], mode: Mode) -> Result<Crypter, Error> {
        let mut crypter = Crypter::new(self.cipher, mode, &self.enc_key, Some(iv))?;
        crypter.aad_update(b"")?;
        Ok(crypter)
    }

    fn hmac(&self, pkey: &PKey<Private>, data: &[u8]) -> [u8; 32] {
        let mut signer = openssl::sign::Signer::new(MessageDigest::sha256(), pkey).unwrap();
        signer.update(data).unwrap();
        let mut mac = [0u8; 32];
        signer.sign(&mut mac).unwrap();
        mac
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn digests_are_deterministic_and_keyed() {
        let a = CryptConfig::new([1u8; 32]).unwrap();
        let b = CryptConfig::new([2u8; 32]).unwrap();

        assert_eq!(a.compute_digest(b"data"), a.compute_digest(b"data"));
        assert_ne!(a.compute_digest(b"data"), b.compute_digest(b"data"));
        assert_ne!(a.compute_digest(b"data"), a.compute_digest(b"datb"));
    }

    #[test]
    fn nonce_derivation_is_deterministic() {
        let config = CryptConfig::new([7u8; 32]).unwrap();
        let id = config.compute_digest(b"some content");
        assert_eq!(config.derive_nonce(&id), config.derive_nonce(&id));
        assert_ne!(config.derive_nonce(&id), config.derive_nonce(b"other"));
    }

    #[test]
    fn fingerprint_differs_per_key() {
        let a = CryptConfig::new([1u8; 32]).unwrap();
        let b = CryptConfig::new([9u8; 32]).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
