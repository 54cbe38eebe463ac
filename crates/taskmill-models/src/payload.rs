//! Opaque task payloads.
//!
//! Request and result data cross the engine boundary as raw byte blobs.
//! The engine stores and returns them verbatim and never inspects their
//! shape; typed (de)serialization belongs to the job handler. On the wire
//! (events, JSON-encoded rows) a payload is a standard base64 string.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors from payload helper conversions.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// An opaque byte blob carried through the engine untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// An empty payload.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Wrap raw bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Encode a serializable value as a JSON payload.
    ///
    /// Convenience for callers; the engine itself never uses this.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, PayloadError> {
        Ok(Self(serde_json::to_vec(value)?))
    }

    /// Decode the payload as JSON into a typed value.
    pub fn to_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, PayloadError> {
        Ok(serde_json::from_slice(&self.0)?)
    }

    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into the raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(s.as_bytes()).map_err(D::Error::custom)?;
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_wire_format() {
        let payload = Payload::from_bytes(b"hello queue");
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, format!("\"{}\"", STANDARD.encode(b"hello queue")));

        let decoded: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_json_helpers() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Req {
            url: String,
            frames: u32,
        }

        let req = Req {
            url: "https://example.com/v".to_string(),
            frames: 24,
        };
        let payload = Payload::from_json(&req).unwrap();
        let back: Req = payload.to_json().unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let result: Result<Payload, _> = serde_json::from_str("\"not base64!!\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_empty_payload() {
        let payload = Payload::empty();
        assert!(payload.is_empty());
        assert_eq!(payload.len(), 0);
    }
}
