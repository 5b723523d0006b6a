use axum::extract::ws::Message;
use murmur_core::{ConnectionId, Identity, RelayError, SessionId};
use murmur_upstream::UpstreamConnection;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::ServerMessage;

/// Correlation values a request runs under, copied out of the state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Correlation {
    pub resource_id: String,
    pub connect_id: String,
}

struct ConnectionState {
    identity: Option<Identity>,
    correlation: Option<Correlation>,
    upstream: Option<UpstreamConnection>,
    active_session: Option<SessionId>,
    busy: bool,
    last_activity: Instant,
}

/// One accepted client socket.
///
/// The state mutex is synchronous and never held across an `.await`.
pub struct ClientConnection {
    pub id: ConnectionId,
    /// Per-process accept ordinal, for log correlation.
    pub ordinal: u64,
    created_at: Instant,
    outbound: mpsc::Sender<Message>,
    cancel: CancellationToken,
    state: Mutex<ConnectionState>,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, ordinal: u64, outbound: mpsc::Sender<Message>) -> Self {
        let now = Instant::now();
        Self {
            id,
            ordinal,
            created_at: now,
            outbound,
            cancel: CancellationToken::new(),
            state: Mutex::new(ConnectionState {
                identity: None,
                correlation: None,
                upstream: None,
                active_session: None,
                busy: false,
                last_activity: now,
            }),
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal the reader, writer and any request task to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.lock().identity.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().identity.is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().busy
    }

    /// Bind the identity and correlation ids. Once set they never change.
    pub fn authenticate(
        &self,
        identity: Identity,
        correlation: Correlation,
    ) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        if state.identity.is_some() {
            return Err(RelayError::Protocol("connection is already authenticated".into()));
        }
        state.identity = Some(identity);
        state.correlation = Some(correlation);
        Ok(())
    }

    /// Move from idle to busy if the request may run.
    pub fn begin_request(&self, connect_id: &str) -> Result<Correlation, RelayError> {
        let mut state = self.state.lock();
        let Some(correlation) = state.correlation.clone().filter(|_| state.identity.is_some())
        else {
            return Err(RelayError::NotAuthenticated);
        };
        if state.busy {
            return Err(RelayError::Protocol(
                "a synthesis request is already in progress".into(),
            ));
        }
        if connect_id.is_empty() || connect_id != correlation.connect_id {
            return Err(RelayError::ConnectIdMismatch);
        }
        state.busy = true;
        Ok(correlation)
    }

    /// Back to idle. Counts as activity.
    pub fn end_request(&self) {
        let mut state = self.state.lock();
        state.busy = false;
        state.active_session = None;
        state.last_activity = Instant::now();
    }

    pub fn take_upstream(&self) -> Option<UpstreamConnection> {
        self.state.lock().upstream.take()
    }

    /// Park the socket for the next request. A closed connection hands it
    /// back so the caller can shut it down.
    pub fn restore_upstream(&self, upstream: UpstreamConnection) -> Option<UpstreamConnection> {
        let mut state = self.state.lock();
        if self.cancel.is_cancelled() {
            return Some(upstream);
        }
        state.upstream = Some(upstream);
        None
    }

    pub fn set_active_session(&self, session: SessionId) {
        self.state.lock().active_session = Some(session);
    }

    pub fn take_active_session(&self) -> Option<SessionId> {
        self.state.lock().active_session.take()
    }

    /// Queue a frame for the writer, waiting for room. False once the writer is gone.
    pub async fn send(&self, message: Message) -> bool {
        self.touch();
        self.outbound.send(message).await.is_ok()
    }

    pub async fn send_control(&self, message: &ServerMessage) -> bool {
        self.send(Message::Text(message.to_json().into())).await
    }

    /// Queue a control frame without waiting. Used on paths that must not
    /// stall behind a slow client.
    pub fn try_send_control(&self, message: &ServerMessage) -> bool {
        self.outbound
            .try_send(Message::Text(message.to_json().into()))
            .is_ok()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("ordinal", &self.ordinal)
            .field("authenticated", &self.is_authenticated())
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (ClientConnection, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(4);
        (ClientConnection::new(ConnectionId::new(), 1, tx), rx)
    }

    fn correlation() -> Correlation {
        Correlation {
            resource_id: "res".into(),
            connect_id: "c-1".into(),
        }
    }

    #[test]
    fn request_before_auth_is_rejected() {
        let (conn, _rx) = connection();
        assert_eq!(conn.begin_request("c-1"), Err(RelayError::NotAuthenticated));
        assert!(!conn.is_busy());
    }

    #[test]
    fn identity_is_immutable() {
        let (conn, _rx) = connection();
        conn.authenticate(Identity::new("u1"), correlation()).unwrap();
        let again = conn.authenticate(Identity::new("u2"), correlation());
        assert!(matches!(again, Err(RelayError::Protocol(_))));
        assert_eq!(conn.identity().unwrap().uid, "u1");
    }

    #[test]
    fn connect_id_must_match() {
        let (conn, _rx) = connection();
        conn.authenticate(Identity::new("u1"), correlation()).unwrap();
        assert_eq!(conn.begin_request("c-2"), Err(RelayError::ConnectIdMismatch));
        assert_eq!(conn.begin_request(""), Err(RelayError::ConnectIdMismatch));
        assert!(!conn.is_busy());
    }

    #[test]
    fn busy_rejects_overlap_until_end() {
        let (conn, _rx) = connection();
        conn.authenticate(Identity::new("u1"), correlation()).unwrap();
        assert_eq!(conn.begin_request("c-1"), Ok(correlation()));
        assert!(matches!(conn.begin_request("c-1"), Err(RelayError::Protocol(_))));

        conn.set_active_session(SessionId::from_raw("tts_1"));
        conn.end_request();
        assert!(conn.take_active_session().is_none());
        assert!(conn.begin_request("c-1").is_ok());
    }

    #[tokio::test]
    async fn send_touches_activity() {
        tokio::time::pause();
        let (conn, mut rx) = connection();
        let before = conn.last_activity();
        tokio::time::advance(std::time::Duration::from_secs(5)).await;

        assert!(conn.send_control(&ServerMessage::End).await);
        assert!(conn.last_activity() > before);
        assert!(matches!(rx.recv().await, Some(Message::Text(_))));
    }

    #[tokio::test]
    async fn send_fails_once_writer_is_gone() {
        let (conn, rx) = connection();
        drop(rx);
        assert!(!conn.send_control(&ServerMessage::End).await);
        assert!(!conn.try_send_control(&ServerMessage::End));
    }

    #[test]
    fn close_is_observable() {
        let (conn, _rx) = connection();
        assert!(!conn.is_closed());
        conn.close();
        conn.close();
        assert!(conn.is_closed());
    }
}
