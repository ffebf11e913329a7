//! Versioned envelope for persisted records.
//!
//! Definitions, checkpoints and idempotency entries are stored as
//! `{"version": N, "payload": ...}` so a newer worker can read records
//! written by an older one, and an older worker refuses records it does not
//! understand instead of misreading them.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};

/// The current envelope version.
pub const CURRENT_VERSION: u32 = 1;

/// A versioned envelope that wraps serialized data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// The version of the envelope format.
    pub version: u32,
    /// The wrapped payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Creates a new envelope with the current version.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            version: CURRENT_VERSION,
            payload,
        }
    }

    /// Unwraps the envelope, returning the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// Envelope with an undecoded payload, for checking the version first.
#[derive(Debug, Clone, PartialEq, Deserialize)]
struct RawEnvelope {
    version: u32,
    payload: serde_json::Value,
}

/// Wraps a record in the current envelope and encodes it as JSON bytes.
///
/// # Errors
///
/// Returns `Serialization` if the record cannot be encoded.
pub fn encode<T: Serialize>(payload: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(&Envelope::new(payload)).map_err(|e| StoreError::Serialization {
        message: e.to_string(),
    })
}

/// Decodes JSON bytes written by [`encode`].
///
/// # Errors
///
/// Returns `Serialization` for malformed bytes or an envelope version newer
/// than this build understands.
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization {
        message: e.to_string(),
    })?;
    if raw.version > CURRENT_VERSION {
        return Err(StoreError::Serialization {
            message: format!(
                "envelope version {} is newer than supported version {CURRENT_VERSION}",
                raw.version
            ),
        });
    }
    serde_json::from_value(raw.payload).map_err(|e| StoreError::Serialization {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Checkpoint {
        node: String,
        seq: u64,
    }

    #[test]
    fn encoded_records_carry_version() {
        let bytes = encode(&Checkpoint {
            node: "send".to_string(),
            seq: 3,
        })
        .expect("encode");
        let json: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(json["version"], CURRENT_VERSION);
        assert_eq!(json["payload"]["node"], "send");

        let decoded: Checkpoint = decode(&bytes).expect("decode");
        assert_eq!(decoded.seq, 3);
    }

    #[test]
    fn newer_versions_are_refused() {
        let bytes = serde_json::to_vec(&json!({
            "version": CURRENT_VERSION + 1,
            "payload": { "node": "send", "seq": 1 }
        }))
        .expect("bytes");
        let err = decode::<Checkpoint>(&bytes).expect_err("too new");
        assert!(matches!(err, StoreError::Serialization { .. }));
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        assert!(matches!(
            decode::<Checkpoint>(b"not json"),
            Err(StoreError::Serialization { .. })
        ));
    }
}
