//! Optional blob-level retention configuration (`silo.blobcfg`).

use anyhow::Error;
use serde::{Deserialize, Serialize};

use silo_api_types::RepoError;

/// Hints for backends with object-lock / retention support. Stored as a
/// plaintext well-known blob next to the format blob.
#[derive(Deserialize, Serialize, Clone, Default, Debug)]
#[serde(rename_all = "kebab-case")]
pub struct BlobRetentionConfig {
    /// Desired minimum retention for immutable blobs, seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_seconds: Option<u64>,
}

impl BlobRetentionConfig {
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(data)
            .map_err(|err| RepoError::Corrupt(format!("unparseable blob config - {}", err)).into())
    }
}
