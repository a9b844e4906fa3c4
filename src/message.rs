use serde::{Deserialize, Serialize};

use crate::pipeline::CodecIdentity;

/// Tagged outbound message, bincode-encoded and handed to the caller as opaque bytes.
///
/// Every run emits exactly one [`StreamMessage::Codec`] first and exactly one
/// [`StreamMessage::Ended`] last, with any number of `Frame`/`MomentClipSaved` in between.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StreamMessage {
    Codec(CodecIdentity),
    Frame {
        data: Vec<u8>,
        /// Present iff the run is ephemeral.
        timestamp_ms: Option<i64>,
    },
    MomentClipSaved {
        moment_id: String,
        clip_path: String,
    },
    Ended,
}

/// Wraps a [`StreamMessage`] with the routing metadata every outbound message carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEnvelope {
    pub id: String,
    pub session_id: Option<String>,
    pub is_ephemeral: bool,
    pub message: StreamMessage,
}

impl StreamEnvelope {
    pub fn encode(&self) -> anyhow::Result<bytes::Bytes> {
        Ok(bytes::Bytes::from(bincode::serialize(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_bincode() {
        let env = StreamEnvelope {
            id: "cam-1".to_string(),
            session_id: Some("sess-1".to_string()),
            is_ephemeral: false,
            message: StreamMessage::Frame {
                data: vec![1, 2, 3],
                timestamp_ms: None,
            },
        };
        let bytes = env.encode().unwrap();
        let decoded: StreamEnvelope = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, env);
    }
}
