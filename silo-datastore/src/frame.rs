//! Content frame binary format.
//!
//! Every content is stored as one frame inside a pack blob: an 8 byte
//! magic, a CRC32 over everything after the header, for encrypted frames
//! a 16 byte IV and 16 byte GCM tag, then the (optionally compressed,
//! optionally encrypted) payload. Frames are self-contained; a pack is a
//! plain concatenation of frames.

use anyhow::{bail, Error};

use silo_api_types::RepoError;
use silo_tools::CryptConfig;

use crate::file_formats::*;

/// Frames larger than this are rejected outright.
const MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

/// Compression level for content payloads.
const COMPRESSION_LEVEL: i32 = 1;

/// One encoded content frame.
pub struct DataFrame {
    raw: Vec<u8>,
}

impl DataFrame {
    /// Encode plaintext into a frame.
    ///
    /// With `crypt` the payload is AES-256-GCM encrypted under the given
    /// IV (derived deterministically from the content id by the caller).
    /// Compression is applied only when it actually shrinks the payload.
    pub fn encode(
        data: &[u8],
        crypt: Option<(&CryptConfig, [u8; 16])>,
        compress: bool,
    ) -> Result<Self, Error> {
        if data.len() > MAX_FRAME_SIZE {
            bail!("content too large ({} bytes)", data.len());
        }

        let compressed;
        let (payload, was_compressed) = if compress {
            compressed = zstd::bulk::compress(data, COMPRESSION_LEVEL)?;
            if compressed.len() < data.len() {
                (&compressed[..], true)
            } else {
                (data, false)
            }
        } else {
            (data, false)
        };

        let raw = match crypt {
            Some((config, iv)) => {
                let magic = if was_compressed {
                    ENCR_COMPR_FRAME_MAGIC_1_0
                } else {
                    ENCRYPTED_FRAME_MAGIC_1_0
                };

                let mut tag = [0u8; 16];
                let cipher_data = openssl::symm::encrypt_aead(
                    *config.cipher(),
                    config.enc_key(),
                    Some(&iv),
                    b"",
                    payload,
                    &mut tag,
                )?;

                let mut raw =
                    Vec::with_capacity(ENCRYPTED_FRAME_HEADER_SIZE + cipher_data.len());
                raw.extend_from_slice(&magic);
                raw.extend_from_slice(&[0u8; 4]); // crc, filled below
                raw.extend_from_slice(&iv);
                raw.extend_from_slice(&tag);
                raw.extend_from_slice(&cipher_data);
                raw
            }
            None => {
                let magic = if was_compressed {
                    COMPRESSED_FRAME_MAGIC_1_0
                } else {
                    UNCOMPRESSED_FRAME_MAGIC_1_0
                };
                let mut raw = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
                raw.extend_from_slice(&magic);
                raw.extend_from_slice(&[0u8; 4]);
                raw.extend_from_slice(payload);
                raw
            }
        };

        let mut frame = Self { raw };
        frame.set_crc(frame.compute_crc());
        Ok(frame)
    }

    /// Wrap raw bytes read back from a pack. Checks the magic and size
    /// bounds only; call [`verify_crc`](Self::verify_crc) or decode to
    /// validate further.
    pub fn from_raw(raw: Vec<u8>) -> Result<Self, Error> {
        if raw.len() < FRAME_HEADER_SIZE {
            return Err(RepoError::Corrupt(format!("frame too small ({} bytes)", raw.len())).into());
        }
        let magic: [u8; 8] = raw[0..8].try_into().unwrap();
        if raw.len() < header_size(&magic) {
            return Err(RepoError::Corrupt("truncated frame header".to_string()).into());
        }
        match magic {
            UNCOMPRESSED_FRAME_MAGIC_1_0
            | COMPRESSED_FRAME_MAGIC_1_0
            | ENCRYPTED_FRAME_MAGIC_1_0
            | ENCR_COMPR_FRAME_MAGIC_1_0 => Ok(Self { raw }),
            _ => Err(RepoError::Corrupt("invalid frame magic".to_string()).into()),
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }

    pub fn magic(&self) -> &[u8; 8] {
        self.raw[0..8].try_into().unwrap()
    }

    pub fn is_encrypted(&self) -> bool {
        let magic = self.magic();
        magic == &ENCRYPTED_FRAME_MAGIC_1_0 || magic == &ENCR_COMPR_FRAME_MAGIC_1_0
    }

    pub fn is_compressed(&self) -> bool {
        let magic = self.magic();
        magic == &COMPRESSED_FRAME_MAGIC_1_0 || magic == &ENCR_COMPR_FRAME_MAGIC_1_0
    }

    pub fn crc(&self) -> u32 {
        u32::from_le_bytes(self.raw[8..12].try_into().unwrap())
    }

    fn set_crc(&mut self, crc: u32) {
        self.raw[8..12].copy_from_slice(&crc.to_le_bytes());
    }

    pub fn compute_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.raw[header_size(self.magic())..]);
        hasher.finalize()
    }

    pub fn verify_crc(&self) -> Result<(), Error> {
        if self.compute_crc() != self.crc() {
            return Err(RepoError::Corrupt("frame crc mismatch".to_string()).into());
        }
        Ok(())
    }

    /// Decode back to plaintext. Encrypted frames require the crypt
    /// config; authentication failures surface as `Corrupt`.
    pub fn decode(&self, crypt: Option<&CryptConfig>) -> Result<Vec<u8>, Error> {
        let magic = self.magic();

        if magic == &UNCOMPRESSED_FRAME_MAGIC_1_0 {
            return Ok(self.raw[FRAME_HEADER_SIZE..].to_vec());
        }

        if magic == &COMPRESSED_FRAME_MAGIC_1_0 {
            let mut reader = &self.raw[FRAME_HEADER_SIZE..];
            return Ok(zstd::stream::decode_all(&mut reader)?);
        }

        let config = match crypt {
            Some(config) => config,
            None => bail!("unable to decrypt frame - no crypt config"),
        };

        let iv = &self.raw[12..28];
        let tag = &self.raw[28..44];
        let cipher_data = &self.raw[ENCRYPTED_FRAME_HEADER_SIZE..];

        let payload = openssl::symm::decrypt_aead(
            *config.cipher(),
            config.enc_key(),
            Some(iv),
            b"",
            cipher_data,
            tag,
        )
        .map_err(|_| RepoError::Corrupt("frame decryption failed".to_string()))?;

        if magic == &ENCR_COMPR_FRAME_MAGIC_1_0 {
            let mut reader = &payload[..];
            Ok(zstd::stream::decode_all(&mut reader)?)
        } else {
            Ok(payload)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use silo_api_types::is_corrupt;

    fn crypt() -> CryptConfig {
        CryptConfig::new([11u8; 32]).unwrap()
    }

    #[test]
    fn plain_roundtrip() {
        let frame = DataFrame::encode(b"some data", None, false).unwrap();
        assert!(!frame.is_encrypted());
        assert!(!frame.is_compressed());
        frame.verify_crc().unwrap();

        let reloaded = DataFrame::from_raw(frame.into_raw()).unwrap();
        assert_eq!(reloaded.decode(None).unwrap(), b"some data");
    }

    #[test]
    fn compression_only_when_smaller() {
        let compressible = vec![b'a'; 64 * 1024];
        let frame = DataFrame::encode(&compressible, None, true).unwrap();
        assert!(frame.is_compressed());
        assert!(frame.raw().len() < compressible.len() / 4);
        assert_eq!(frame.decode(None).unwrap(), compressible);

        // incompressible data stays uncompressed
        let mut random = vec![0u8; 4096];
        openssl::rand::rand_bytes(&mut random).unwrap();
        let frame = DataFrame::encode(&random, None, true).unwrap();
        assert!(!frame.is_compressed());
        assert_eq!(frame.decode(None).unwrap(), random);
    }

    #[test]
    fn encrypted_roundtrip_and_wrong_key() {
        let config = crypt();
        let iv = config.derive_nonce(b"id");
        let frame = DataFrame::encode(b"secret payload", Some((&config, iv)), true).unwrap();
        assert!(frame.is_encrypted());
        frame.verify_crc().unwrap();
        assert_eq!(frame.decode(Some(&config)).unwrap(), b"secret payload");

        let wrong = CryptConfig::new([12u8; 32]).unwrap();
        let err = frame.decode(Some(&wrong)).unwrap_err();
        assert!(is_corrupt(&err));
    }

    #[test]
    fn deterministic_for_same_iv() {
        let config = crypt();
        let iv = config.derive_nonce(b"id");
        let a = DataFrame::encode(b"data", Some((&config, iv)), false).unwrap();
        let b = DataFrame::encode(b"data", Some((&config, iv)), false).unwrap();
        assert_eq!(a.raw(), b.raw());
    }

    #[test]
    fn corrupt_bytes_are_rejected() {
        let frame = DataFrame::encode(b"payload", None, false).unwrap();
        let mut raw = frame.into_raw();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let frame = DataFrame::from_raw(raw).unwrap();
        assert!(frame.verify_crc().is_err());

        assert!(DataFrame::from_raw(vec![0u8; 32]).is_err());
        assert!(DataFrame::from_raw(vec![1, 2, 3]).is_err());
    }

    #[test]
    fn zero_length_payload() {
        let config = crypt();
        let iv = config.derive_nonce(b"empty");
        let frame = DataFrame::encode(b"", Some((&config, iv)), true).unwrap();
        assert_eq!(frame.decode(Some(&config)).unwrap(), b"");
    }
}
