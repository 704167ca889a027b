use std::fmt;
use std::str::FromStr;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Size of a content digest (HMAC-SHA-256) in bytes.
pub const CONTENT_DIGEST_SIZE: usize = 32;

/// No namespace - plain file data, stored in data (`p`) packs.
pub const NS_NONE: u8 = 0;
/// Manifest store records.
pub const NS_MANIFEST: u8 = b'm';
/// Indirect object blocks.
pub const NS_INDIRECT: u8 = b'I';
/// Directory manifests.
pub const NS_DIRECTORY: u8 = b'k';

const VALID_NAMESPACES: &[u8] = &[NS_MANIFEST, NS_INDIRECT, NS_DIRECTORY];

/// Identifier of a stored content: an optional one-byte namespace letter
/// plus the HMAC-SHA-256 of the plaintext under the repository's content
/// HMAC key.
///
/// Rendered as `[letter]<64 hex digits>`. The derived ordering (namespace
/// first, then digest) is the canonical index order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentId {
    namespace: u8,
    digest: [u8; CONTENT_DIGEST_SIZE],
}

impl ContentId {
    pub fn new(namespace: u8, digest: [u8; CONTENT_DIGEST_SIZE]) -> Self {
        Self { namespace, digest }
    }

    pub fn plain(digest: [u8; CONTENT_DIGEST_SIZE]) -> Self {
        Self::new(NS_NONE, digest)
    }

    pub fn namespace(&self) -> u8 {
        self.namespace
    }

    pub fn digest(&self) -> &[u8; CONTENT_DIGEST_SIZE] {
        &self.digest
    }

    /// Namespaced contents hold repository metadata (manifests, indirect
    /// blocks, directory listings) and are stored in metadata (`q`) packs.
    pub fn is_metadata(&self) -> bool {
        self.namespace != NS_NONE
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.namespace != NS_NONE {
            write!(f, "{}", self.namespace as char)?;
        }
        write!(f, "{}", hex::encode(self.digest))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ContentId({})", self)
    }
}

impl FromStr for ContentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (namespace, hex_part) = match s.len() {
            n if n == CONTENT_DIGEST_SIZE * 2 => (NS_NONE, s),
            n if n == CONTENT_DIGEST_SIZE * 2 + 1 => {
                let ns = s.as_bytes()[0];
                if !VALID_NAMESPACES.contains(&ns) {
                    bail!("invalid content namespace '{}'", ns as char);
                }
                (ns, &s[1..])
            }
            n => bail!("invalid content id length {}", n),
        };

        let mut digest = [0u8; CONTENT_DIGEST_SIZE];
        hex::decode_to_slice(hex_part, &mut digest)
            .map_err(|err| format_err!("invalid content id '{}' - {}", s, err))?;

        Ok(Self { namespace, digest })
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Reference to a stored byte stream.
///
/// Small objects live inline in the id itself, single-chunk objects point
/// at their content directly, and large objects point at an indirect block
/// (namespace `I`) listing child object ids.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ObjectId {
    Inline(Vec<u8>),
    Direct(ContentId),
    Indirect(ContentId),
}

impl ObjectId {
    pub fn indirect(digest: [u8; CONTENT_DIGEST_SIZE]) -> Self {
        ObjectId::Indirect(ContentId::new(NS_INDIRECT, digest))
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, ObjectId::Inline(_))
    }

    /// The content this id points at, if it is not inline.
    pub fn content_id(&self) -> Option<&ContentId> {
        match self {
            ObjectId::Inline(_) => None,
            ObjectId::Direct(id) | ObjectId::Indirect(id) => Some(id),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObjectId::Inline(data) => write!(f, "inline:{}", hex::encode(data)),
            ObjectId::Direct(id) => write!(f, "{}", id),
            ObjectId::Indirect(id) => write!(f, "{}", id),
        }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ObjectId({})", self)
    }
}

impl FromStr for ObjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if let Some(hex_part) = s.strip_prefix("inline:") {
            let data = hex::decode(hex_part)
                .map_err(|err| format_err!("invalid inline object id - {}", err))?;
            return Ok(ObjectId::Inline(data));
        }

        let id: ContentId = s.parse()?;
        if id.namespace() == NS_INDIRECT {
            Ok(ObjectId::Indirect(id))
        } else {
            Ok(ObjectId::Direct(id))
        }
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifier of a manifest record (16 random hex digits).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestId(String);

impl ManifestId {
    pub fn new(id: String) -> Result<Self, Error> {
        if id.len() != 16 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("invalid manifest id '{}'", id);
        }
        Ok(Self(id))
    }

    pub fn from_random_bytes(bytes: [u8; 8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ManifestId({})", self.0)
    }
}

impl FromStr for ManifestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::new(s.to_owned())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn content_id_roundtrip() {
        let id = ContentId::new(NS_MANIFEST, [0xabu8; 32]);
        let text = id.to_string();
        assert!(text.starts_with('m'));
        assert_eq!(text.len(), 65);
        assert_eq!(text.parse::<ContentId>().unwrap(), id);

        let plain = ContentId::plain([3u8; 32]);
        assert_eq!(plain.to_string().parse::<ContentId>().unwrap(), plain);
        assert!(!plain.is_metadata());
    }

    #[test]
    fn content_id_rejects_garbage() {
        assert!("xyz".parse::<ContentId>().is_err());
        assert!("Z0000000000000000000000000000000000000000000000000000000000000000"
            .parse::<ContentId>()
            .is_err());
    }

    #[test]
    fn object_id_roundtrip() {
        let inline = ObjectId::Inline(vec![1, 2, 3]);
        assert_eq!(
            inline.to_string().parse::<ObjectId>().unwrap(),
            inline
        );

        let indirect = ObjectId::indirect([7u8; 32]);
        let text = indirect.to_string();
        assert!(text.starts_with('I'));
        assert_eq!(text.parse::<ObjectId>().unwrap(), indirect);

        let direct = ObjectId::Direct(ContentId::plain([9u8; 32]));
        assert_eq!(direct.to_string().parse::<ObjectId>().unwrap(), direct);
    }
}
