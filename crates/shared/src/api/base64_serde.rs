//! Serde adapter that encodes byte vectors as standard base64 strings.
//!
//! Use with `#[serde(with = "base64_serde")]` on `Vec<u8>` fields.

use base64::Engine;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    base64::engine::general_purpose::STANDARD
        .decode(s.as_bytes())
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Blob {
        #[serde(with = "super")]
        data: Vec<u8>,
    }

    #[test]
    fn bytes_are_encoded_as_base64_text() {
        let blob = Blob {
            data: b"wrapped".to_vec(),
        };
        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, r#"{"data":"d3JhcHBlZA=="}"#);
    }

    #[test]
    fn invalid_base64_is_rejected() {
        let result = serde_json::from_str::<Blob>(r#"{"data":"***"}"#);
        assert!(result.is_err());
    }
}
