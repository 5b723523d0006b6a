use std::time::Duration;

use murmur_core::RelayError;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("failed to connect to provider: {0}")]
    Connect(String),
    #[error("provider socket error: {0}")]
    Transport(String),
    #[error("provider socket closed")]
    Closed,
    #[error("timed out after {timeout:?} waiting for {waiting_for}")]
    EventTimeout {
        waiting_for: &'static str,
        timeout: Duration,
    },
    /// StartConnection was refused or never acknowledged.
    #[error("provider handshake failed: {0}")]
    Handshake(Box<UpstreamError>),
    #[error("malformed provider frame: {0}")]
    Malformed(String),
    #[error("provider reported failure (code {code}): {message}")]
    Provider { code: u32, message: String },
    #[error("text cannot be empty")]
    EmptyText,
    #[error("no audio data received")]
    NoAudio,
    #[error("session {0} not found")]
    SessionNotFound(String),
}

impl UpstreamError {
    /// Whether the socket that produced this error is unusable afterwards.
    ///
    /// A socket that timed out or returned garbage may still deliver stale
    /// frames for the abandoned session, so it is not reused either.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            Self::Connect(_)
                | Self::Handshake(_)
                | Self::Transport(_)
                | Self::Closed
                | Self::EventTimeout { .. }
                | Self::Malformed(_)
                | Self::Provider { .. }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for UpstreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => Self::Closed,
            other => Self::Transport(other.to_string()),
        }
    }
}

impl From<UpstreamError> for RelayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Connect(_)
            | UpstreamError::Handshake(_)
            | UpstreamError::Transport(_)
            | UpstreamError::Closed
            | UpstreamError::EventTimeout { .. } => RelayError::UpstreamConnection(err.to_string()),
            UpstreamError::Malformed(_)
            | UpstreamError::Provider { .. }
            | UpstreamError::EmptyText
            | UpstreamError::NoAudio
            | UpstreamError::SessionNotFound(_) => RelayError::Synthesis(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_failures_poison_connection() {
        assert!(UpstreamError::Closed.poisons_connection());
        assert!(UpstreamError::Transport("reset".into()).poisons_connection());
        assert!(UpstreamError::EventTimeout {
            waiting_for: "SessionStarted",
            timeout: Duration::from_secs(1)
        }
        .poisons_connection());
    }

    #[test]
    fn request_failures_keep_connection() {
        assert!(!UpstreamError::EmptyText.poisons_connection());
        assert!(!UpstreamError::NoAudio.poisons_connection());
    }

    #[test]
    fn relay_error_mapping() {
        assert!(matches!(
            RelayError::from(UpstreamError::Connect("refused".into())),
            RelayError::UpstreamConnection(_)
        ));
        assert_eq!(
            RelayError::from(UpstreamError::EmptyText),
            RelayError::Synthesis("text cannot be empty".into())
        );
    }

    #[test]
    fn handshake_failures_are_connection_errors() {
        let refused = UpstreamError::Handshake(Box::new(UpstreamError::Provider {
            code: 45_000_001,
            message: "invalid resource".into(),
        }));
        match RelayError::from(refused) {
            RelayError::UpstreamConnection(message) => {
                assert!(message.starts_with("provider handshake failed"));
                assert!(message.contains("invalid resource"));
            }
            other => panic!("expected upstream connection error, got {other:?}"),
        }

        let garbled = UpstreamError::Handshake(Box::new(UpstreamError::Malformed("short".into())));
        assert!(matches!(
            RelayError::from(garbled),
            RelayError::UpstreamConnection(_)
        ));
    }

    #[test]
    fn timeout_display_names_event() {
        let err = UpstreamError::EventTimeout {
            waiting_for: "ConnectionStarted",
            timeout: Duration::from_millis(500),
        };
        assert_eq!(err.to_string(), "timed out after 500ms waiting for ConnectionStarted");
    }
}
