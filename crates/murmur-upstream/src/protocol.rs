//! Provider binary frame format.
//!
//! ```text
//! byte 0  version (4 bits) | header size in 4-byte words (4 bits)
//! byte 1  message type (4 bits) | flags (4 bits)
//! byte 2  serialization (4 bits) | compression (4 bits)
//! byte 3  reserved
//! [i32 sequence]              when flags carry a sequence
//! [u32 error code]            error frames only
//! [i32 event]                 when flags == WithEvent
//! [u32 len + session id]      every event except connection-level ones
//! [u32 len + connect id]      ConnectionStarted / ConnectionFailed / ConnectionFinished
//! u32 len + payload
//! ```
//!
//! All integers are big-endian.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use murmur_core::SessionId;

use crate::error::UpstreamError;

const PROTOCOL_VERSION: u8 = 0b0001;
const HEADER_WORDS: u8 = 0b0001;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    FullClientRequest = 0b0001,
    AudioOnlyClient = 0b0010,
    FullServerResponse = 0b1001,
    AudioOnlyServer = 0b1011,
    FrontEndResultServer = 0b1100,
    Error = 0b1111,
}

impl TryFrom<u8> for MsgType {
    type Error = UpstreamError;

    fn try_from(value: u8) -> Result<Self, UpstreamError> {
        match value {
            0b0001 => Ok(Self::FullClientRequest),
            0b0010 => Ok(Self::AudioOnlyClient),
            0b1001 => Ok(Self::FullServerResponse),
            0b1011 => Ok(Self::AudioOnlyServer),
            0b1100 => Ok(Self::FrontEndResultServer),
            0b1111 => Ok(Self::Error),
            other => Err(UpstreamError::Malformed(format!("unknown message type {other:#06b}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Flags {
    NoSeq = 0,
    PositiveSeq = 1,
    LastNoSeq = 2,
    NegativeSeq = 3,
    WithEvent = 4,
}

impl Flags {
    fn has_sequence(self) -> bool {
        matches!(self, Self::PositiveSeq | Self::NegativeSeq)
    }
}

impl TryFrom<u8> for Flags {
    type Error = UpstreamError;

    fn try_from(value: u8) -> Result<Self, UpstreamError> {
        match value {
            0 => Ok(Self::NoSeq),
            1 => Ok(Self::PositiveSeq),
            2 => Ok(Self::LastNoSeq),
            3 => Ok(Self::NegativeSeq),
            4 => Ok(Self::WithEvent),
            other => Err(UpstreamError::Malformed(format!("unknown flags {other:#06b}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Serialization {
    Raw = 0,
    Json = 1,
}

impl TryFrom<u8> for Serialization {
    type Error = UpstreamError;

    fn try_from(value: u8) -> Result<Self, UpstreamError> {
        match value {
            0 => Ok(Self::Raw),
            1 => Ok(Self::Json),
            other => Err(UpstreamError::Malformed(format!("unknown serialization {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Gzip = 1,
}

impl TryFrom<u8> for Compression {
    type Error = UpstreamError;

    fn try_from(value: u8) -> Result<Self, UpstreamError> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            other => Err(UpstreamError::Malformed(format!("unknown compression {other}"))),
        }
    }
}

/// Protocol event code. Unknown codes are carried through untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Event(pub i32);

impl Event {
    // Client -> provider
    pub const START_CONNECTION: Event = Event(1);
    pub const FINISH_CONNECTION: Event = Event(2);
    pub const START_SESSION: Event = Event(100);
    pub const CANCEL_SESSION: Event = Event(101);
    pub const FINISH_SESSION: Event = Event(102);
    pub const TASK_REQUEST: Event = Event(200);

    // Provider -> client
    pub const CONNECTION_STARTED: Event = Event(50);
    pub const CONNECTION_FAILED: Event = Event(51);
    pub const CONNECTION_FINISHED: Event = Event(52);
    pub const SESSION_STARTED: Event = Event(150);
    pub const SESSION_CANCELED: Event = Event(151);
    pub const SESSION_FINISHED: Event = Event(152);
    pub const SESSION_FAILED: Event = Event(153);
    pub const SENTENCE_START: Event = Event(350);
    pub const SENTENCE_END: Event = Event(351);
    pub const TTS_RESPONSE: Event = Event(352);

    pub fn name(self) -> &'static str {
        match self.0 {
            1 => "StartConnection",
            2 => "FinishConnection",
            50 => "ConnectionStarted",
            51 => "ConnectionFailed",
            52 => "ConnectionFinished",
            100 => "StartSession",
            101 => "CancelSession",
            102 => "FinishSession",
            150 => "SessionStarted",
            151 => "SessionCanceled",
            152 => "SessionFinished",
            153 => "SessionFailed",
            200 => "TaskRequest",
            350 => "SentenceStart",
            351 => "SentenceEnd",
            352 => "TtsResponse",
            _ => "Unknown",
        }
    }

    /// Connection-level events carry no session id.
    fn is_connection_level(self) -> bool {
        matches!(self.0, 1 | 2 | 50 | 51 | 52)
    }

    fn carries_connect_id(self) -> bool {
        matches!(self.0, 50 | 51 | 52)
    }

    pub fn is_failure(self) -> bool {
        self == Self::CONNECTION_FAILED || self == Self::SESSION_FAILED
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// One decoded provider frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MsgType,
    pub flags: Flags,
    pub serialization: Serialization,
    pub compression: Compression,
    pub sequence: Option<i32>,
    pub error_code: Option<u32>,
    pub event: Option<Event>,
    pub session_id: Option<String>,
    pub connect_id: Option<String>,
    pub payload: Bytes,
}

impl Frame {
    /// An event frame with a JSON payload.
    pub fn with_event(
        msg_type: MsgType,
        event: Event,
        session_id: Option<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            msg_type,
            flags: Flags::WithEvent,
            serialization: Serialization::Json,
            compression: Compression::None,
            sequence: None,
            error_code: None,
            event: Some(event),
            session_id,
            connect_id: None,
            payload: payload.into(),
        }
    }

    pub fn start_connection() -> Self {
        Self::with_event(MsgType::FullClientRequest, Event::START_CONNECTION, None, &b"{}"[..])
    }

    pub fn finish_connection() -> Self {
        Self::with_event(MsgType::FullClientRequest, Event::FINISH_CONNECTION, None, &b"{}"[..])
    }

    pub fn start_session(session_id: &SessionId, payload: Vec<u8>) -> Self {
        Self::with_event(
            MsgType::FullClientRequest,
            Event::START_SESSION,
            Some(session_id.to_string()),
            payload,
        )
    }

    pub fn task_request(session_id: &SessionId, payload: Vec<u8>) -> Self {
        Self::with_event(
            MsgType::FullClientRequest,
            Event::TASK_REQUEST,
            Some(session_id.to_string()),
            payload,
        )
    }

    pub fn finish_session(session_id: &SessionId) -> Self {
        Self::with_event(
            MsgType::FullClientRequest,
            Event::FINISH_SESSION,
            Some(session_id.to_string()),
            &b"{}"[..],
        )
    }

    /// Provider-side control event, as a server would send it.
    pub fn server_event(event: Event, id: Option<String>, payload: impl Into<Bytes>) -> Self {
        let mut frame = Self::with_event(MsgType::FullServerResponse, event, None, payload);
        if event.carries_connect_id() {
            frame.connect_id = id;
        } else if !event.is_connection_level() {
            frame.session_id = id;
        }
        frame
    }

    /// Provider-side audio chunk.
    pub fn audio(session_id: impl Into<String>, pcm: impl Into<Bytes>) -> Self {
        let mut frame = Self::with_event(
            MsgType::AudioOnlyServer,
            Event::TTS_RESPONSE,
            Some(session_id.into()),
            pcm,
        );
        frame.serialization = Serialization::Raw;
        frame
    }

    /// Provider-side error frame.
    pub fn error(code: u32, message: impl Into<String>) -> Self {
        Self {
            msg_type: MsgType::Error,
            flags: Flags::NoSeq,
            serialization: Serialization::Json,
            compression: Compression::None,
            sequence: None,
            error_code: Some(code),
            event: None,
            session_id: None,
            connect_id: None,
            payload: Bytes::from(message.into()),
        }
    }

    pub fn is(&self, msg_type: MsgType, event: Event) -> bool {
        self.msg_type == msg_type && self.event == Some(event)
    }

    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Serialize to wire bytes. Fails only if a field outgrows its u32 length prefix.
    pub fn encode(&self) -> Result<Bytes, UpstreamError> {
        let mut buf = BytesMut::with_capacity(32 + self.payload.len());
        buf.put_u8(PROTOCOL_VERSION << 4 | HEADER_WORDS);
        buf.put_u8((self.msg_type as u8) << 4 | self.flags as u8);
        buf.put_u8((self.serialization as u8) << 4 | self.compression as u8);
        buf.put_u8(0);

        if self.flags.has_sequence() {
            buf.put_i32(self.sequence.unwrap_or(0));
        }
        if self.msg_type == MsgType::Error {
            buf.put_u32(self.error_code.unwrap_or(0));
        }
        if self.flags == Flags::WithEvent {
            let event = self.event.unwrap_or(Event(0));
            buf.put_i32(event.0);
            if !event.is_connection_level() {
                let id = self.session_id.as_deref().unwrap_or("");
                put_prefixed(&mut buf, id.as_bytes(), "session id")?;
            }
            if event.carries_connect_id() {
                let id = self.connect_id.as_deref().unwrap_or("");
                put_prefixed(&mut buf, id.as_bytes(), "connect id")?;
            }
        }
        put_prefixed(&mut buf, &self.payload, "payload")?;
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, UpstreamError> {
        let mut buf = data;
        if buf.remaining() < 4 {
            return Err(UpstreamError::Malformed(format!(
                "frame of {} bytes is shorter than the header",
                data.len()
            )));
        }
        let b0 = buf.get_u8();
        let b1 = buf.get_u8();
        let b2 = buf.get_u8();
        let _reserved = buf.get_u8();

        let header_len = usize::from(b0 & 0x0f) * 4;
        if header_len < 4 {
            return Err(UpstreamError::Malformed("header size of zero words".into()));
        }
        let extension = header_len - 4;
        if buf.remaining() < extension {
            return Err(UpstreamError::Malformed("truncated header extension".into()));
        }
        buf.advance(extension);

        let msg_type = MsgType::try_from(b1 >> 4)?;
        let flags = Flags::try_from(b1 & 0x0f)?;
        let serialization = Serialization::try_from(b2 >> 4)?;
        let compression = Compression::try_from(b2 & 0x0f)?;
        if compression == Compression::Gzip {
            return Err(UpstreamError::Malformed(
                "gzip-compressed frames are not supported".into(),
            ));
        }

        let sequence = if flags.has_sequence() {
            Some(read_i32(&mut buf, "sequence")?)
        } else {
            None
        };
        let error_code = if msg_type == MsgType::Error {
            Some(read_u32(&mut buf, "error code")?)
        } else {
            None
        };

        let mut event = None;
        let mut session_id = None;
        let mut connect_id = None;
        if flags == Flags::WithEvent {
            let ev = Event(read_i32(&mut buf, "event")?);
            if !ev.is_connection_level() {
                session_id = Some(read_string(&mut buf, "session id")?);
            }
            if ev.carries_connect_id() {
                connect_id = Some(read_string(&mut buf, "connect id")?);
            }
            event = Some(ev);
        }

        let payload = read_prefixed(&mut buf, "payload")?;

        Ok(Self {
            msg_type,
            flags,
            serialization,
            compression,
            sequence,
            error_code,
            event,
            session_id,
            connect_id,
            payload,
        })
    }
}

fn prefix_len(len: usize, what: &str) -> Result<u32, UpstreamError> {
    u32::try_from(len).map_err(|_| {
        UpstreamError::Malformed(format!("{what} of {len} bytes exceeds the u32 length prefix"))
    })
}

fn put_prefixed(buf: &mut BytesMut, bytes: &[u8], what: &str) -> Result<(), UpstreamError> {
    buf.put_u32(prefix_len(bytes.len(), what)?);
    buf.put_slice(bytes);
    Ok(())
}

fn read_i32(buf: &mut &[u8], what: &str) -> Result<i32, UpstreamError> {
    if buf.remaining() < 4 {
        return Err(UpstreamError::Malformed(format!("truncated {what}")));
    }
    Ok(buf.get_i32())
}

fn read_u32(buf: &mut &[u8], what: &str) -> Result<u32, UpstreamError> {
    if buf.remaining() < 4 {
        return Err(UpstreamError::Malformed(format!("truncated {what}")));
    }
    Ok(buf.get_u32())
}

fn read_prefixed(buf: &mut &[u8], what: &str) -> Result<Bytes, UpstreamError> {
    let len = read_u32(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(UpstreamError::Malformed(format!(
            "{what} declares {len} bytes but {} remain",
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

fn read_string(buf: &mut &[u8], what: &str) -> Result<String, UpstreamError> {
    let bytes = read_prefixed(buf, what)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| UpstreamError::Malformed(format!("{what} is not valid UTF-8")))
}
