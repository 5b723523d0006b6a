/// Failures a relay connection can hit, classified by how the gateway reacts.
///
/// Terminal errors end the client connection; everything else is reported
/// as a `backend-error` frame and the connection stays open.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    // Terminal
    #[error("server busy: connection limit of {max} reached, please retry later")]
    AdmissionRejected { max: usize },
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("connection timed out: {0}")]
    TimeoutEviction(String),

    // Per-request
    #[error("not authenticated, send front-auth first")]
    NotAuthenticated,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("connectId does not match the authenticated connection")]
    ConnectIdMismatch,
    #[error("upstream connection failed: {0}")]
    UpstreamConnection(String),
    #[error("synthesis failed: {0}")]
    Synthesis(String),
}

impl RelayError {
    /// Whether the client connection must be torn down after reporting.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AdmissionRejected { .. } | Self::AuthenticationFailed(_) | Self::TimeoutEviction(_)
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AdmissionRejected { .. } => "admission_rejected",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::TimeoutEviction(_) => "timeout_eviction",
            Self::NotAuthenticated => "not_authenticated",
            Self::Protocol(_) => "protocol_error",
            Self::ConnectIdMismatch => "connect_id_mismatch",
            Self::UpstreamConnection(_) => "upstream_connection_error",
            Self::Synthesis(_) => "synthesis_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(RelayError::AdmissionRejected { max: 4 }.is_terminal());
        assert!(RelayError::AuthenticationFailed("bad token".into()).is_terminal());
        assert!(RelayError::TimeoutEviction("idle".into()).is_terminal());
    }

    #[test]
    fn per_request_errors_keep_connection() {
        assert!(!RelayError::NotAuthenticated.is_terminal());
        assert!(!RelayError::Protocol("bad json".into()).is_terminal());
        assert!(!RelayError::ConnectIdMismatch.is_terminal());
        assert!(!RelayError::UpstreamConnection("refused".into()).is_terminal());
        assert!(!RelayError::Synthesis("no audio".into()).is_terminal());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(RelayError::ConnectIdMismatch.error_kind(), "connect_id_mismatch");
        assert_eq!(RelayError::Protocol(String::new()).error_kind(), "protocol_error");
        assert_eq!(
            RelayError::AdmissionRejected { max: 1 }.error_kind(),
            "admission_rejected"
        );
    }

    #[test]
    fn display_carries_detail() {
        let err = RelayError::Synthesis("text cannot be empty".into());
        assert_eq!(err.to_string(), "synthesis failed: text cannot be empty");
    }
}
