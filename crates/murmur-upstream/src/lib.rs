//! Client for the provider's bidirectional TTS socket.
//!
//! The provider speaks a binary frame format (see [`protocol`]) and drives each
//! synthesis through connect → session → task → finish steps. [`TtsDriver`]
//! runs those steps and hands back one concatenated PCM buffer per request.

pub mod connection;
pub mod driver;
pub mod error;
pub mod mock;
pub mod payload;
pub mod protocol;

pub use connection::{Expectation, UpstreamConnection, Verdict};
pub use driver::{split_sentences, DriverConfig, SynthesisSession, TtsDriver};
pub use error::UpstreamError;
pub use payload::AudioParams;
pub use protocol::{Compression, Event, Frame, Flags, MsgType, Serialization};
