//! Client-facing wire format.
//!
//! Control messages are JSON objects discriminated by `type`. Audio travels
//! as binary frames: `[0x01][u32 BE sequence][PCM ≤ 16384 bytes]`.

use bytes::{BufMut, Bytes, BytesMut};
use murmur_core::RelayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const AUDIO_FRAME_KIND: u8 = 0x01;
pub const MAX_AUDIO_PAYLOAD: usize = 16_384;
pub const AUDIO_HEADER_LEN: usize = 5;

/// Client → server control message.
///
/// Fields are optional on the wire so that a missing value can be reported
/// by the state machine rather than as a parse failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "front-auth", rename_all = "camelCase")]
    Auth {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        resource_id: Option<String>,
        #[serde(default)]
        connect_id: Option<String>,
    },
    #[serde(rename = "front-tts", rename_all = "camelCase")]
    Tts {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        voice: Option<String>,
        #[serde(default)]
        connect_id: Option<String>,
    },
}

/// Server → client control message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "backend-auth")]
    Auth,
    #[serde(rename = "backend-error")]
    Error { message: String },
    #[serde(rename = "backend-end")]
    End,
}

impl ServerMessage {
    pub fn error(err: &RelayError) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Tagged enums of strings cannot fail to serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Parse one client control message, classifying failures as protocol errors.
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, RelayError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| RelayError::Protocol(format!("malformed JSON: {e}")))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::Protocol("missing message type".into()))?;
    if !matches!(kind, "front-auth" | "front-tts") {
        return Err(RelayError::Protocol(format!("unknown message type: {kind}")));
    }
    let kind = kind.to_owned();
    serde_json::from_value(value)
        .map_err(|e| RelayError::Protocol(format!("invalid {kind} message: {e}")))
}

/// Whether a binary client frame carries audio rather than JSON.
pub fn is_audio_frame(data: &[u8]) -> bool {
    data.first() == Some(&AUDIO_FRAME_KIND)
}

pub fn encode_audio_frame(sequence: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(AUDIO_HEADER_LEN + payload.len());
    buf.put_u8(AUDIO_FRAME_KIND);
    buf.put_u32(sequence);
    buf.put_slice(payload);
    buf.freeze()
}

/// Split `audio` into consecutive frames numbered from zero.
pub fn audio_frames(audio: &[u8]) -> impl Iterator<Item = Bytes> + '_ {
    audio
        .chunks(MAX_AUDIO_PAYLOAD)
        .zip(0u32..)
        .map(|(chunk, sequence)| encode_audio_frame(sequence, chunk))
}

/// Sequence number and payload of an audio frame.
pub fn decode_audio_frame(frame: &[u8]) -> Option<(u32, &[u8])> {
    if frame.len() < AUDIO_HEADER_LEN || frame[0] != AUDIO_FRAME_KIND {
        return None;
    }
    let sequence = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
    Some((sequence, &frame[AUDIO_HEADER_LEN..]))
}
