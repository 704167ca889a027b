//! Serde helpers for binary fields in JSON records.

/// Serialize `Vec<u8>` fields as base64 strings:
/// `#[serde(with = "silo_tools::serde_helpers::bytes_as_base64")]`
pub mod bytes_as_base64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Record {
        #[serde(with = "super::bytes_as_base64")]
        data: Vec<u8>,
    }

    #[test]
    fn base64_roundtrip() {
        let record = Record {
            data: vec![0, 1, 2, 255],
        };
        let text = serde_json::to_string(&record).unwrap();
        assert!(text.contains("AAEC/w=="));
        let parsed: Record = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.data, vec![0, 1, 2, 255]);
    }
}
