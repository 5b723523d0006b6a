//! One open provider socket and the event-wait primitive over it.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::error::UpstreamError;
use crate::protocol::{Event, Frame, MsgType};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A pending wait for one specific provider event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Expectation {
    pub msg_type: MsgType,
    pub event: Event,
}

/// Outcome of offering a frame to an [`Expectation`].
#[derive(Debug)]
pub enum Verdict {
    Matched,
    /// The provider reported a failure; the wait ends with this error.
    Failed(UpstreamError),
    /// Not the awaited frame; dropped.
    Skip,
}

impl Expectation {
    pub const fn new(msg_type: MsgType, event: Event) -> Self {
        Self { msg_type, event }
    }

    pub const fn server(event: Event) -> Self {
        Self::new(MsgType::FullServerResponse, event)
    }

    pub fn check(&self, frame: &Frame) -> Verdict {
        if frame.msg_type == MsgType::Error {
            return Verdict::Failed(UpstreamError::Provider {
                code: frame.error_code.unwrap_or_default(),
                message: frame.payload_text(),
            });
        }
        if frame.is(self.msg_type, self.event) {
            return Verdict::Matched;
        }
        match frame.event {
            Some(event) if event.is_failure() && frame.msg_type == MsgType::FullServerResponse => {
                Verdict::Failed(UpstreamError::Provider {
                    code: 0,
                    message: format!("{event}: {}", frame.payload_text()),
                })
            }
            _ => Verdict::Skip,
        }
    }
}

/// Provider socket. Strictly one outstanding wait at a time.
pub struct UpstreamConnection {
    stream: WsStream,
    connect_id: String,
}

impl UpstreamConnection {
    pub fn new(stream: WsStream, connect_id: impl Into<String>) -> Self {
        Self {
            stream,
            connect_id: connect_id.into(),
        }
    }

    pub fn connect_id(&self) -> &str {
        &self.connect_id
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<(), UpstreamError> {
        trace!(event = ?frame.event, session_id = ?frame.session_id, "provider frame out");
        self.stream.send(Message::Binary(frame.encode()?)).await?;
        Ok(())
    }

    /// Next binary frame. Text and keepalive messages are skipped.
    pub async fn next_frame(&mut self) -> Result<Frame, UpstreamError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Frame::decode(&data),
                Some(Ok(Message::Close(_))) | None => return Err(UpstreamError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// [`next_frame`](Self::next_frame) bounded by `timeout`.
    pub async fn next_frame_within(
        &mut self,
        timeout: Duration,
        waiting_for: &'static str,
    ) -> Result<Frame, UpstreamError> {
        tokio::time::timeout(timeout, self.next_frame())
            .await
            .map_err(|_| UpstreamError::EventTimeout {
                waiting_for,
                timeout,
            })?
    }

    /// Read frames until `expect` matches, dropping everything else.
    ///
    /// The whole wait, not each frame, is bounded by `timeout`.
    pub async fn wait_for(
        &mut self,
        expect: Expectation,
        timeout: Duration,
    ) -> Result<Frame, UpstreamError> {
        let wait = async {
            loop {
                let frame = match self.next_frame().await {
                    Ok(frame) => frame,
                    Err(err) => return Err(err),
                };
                match expect.check(&frame) {
                    Verdict::Matched => return Ok(frame),
                    Verdict::Failed(err) => return Err(err),
                    Verdict::Skip => {
                        debug!(
                            expected = %expect.event,
                            got = ?frame.event,
                            msg_type = ?frame.msg_type,
                            "dropping unexpected provider frame"
                        );
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| UpstreamError::EventTimeout {
                waiting_for: expect.event.name(),
                timeout,
            })?
    }

    /// Close the socket, ignoring errors from an already-dead peer.
    pub async fn close(mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, connect_id = %self.connect_id, "provider socket close failed");
        }
    }
}

impl std::fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnection")
            .field("connect_id", &self.connect_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn started() -> Expectation {
        Expectation::server(Event::SESSION_STARTED)
    }

    #[test]
    fn matching_frame_is_matched() {
        let frame = Frame::server_event(Event::SESSION_STARTED, Some("s".into()), &b"{}"[..]);
        assert!(matches!(started().check(&frame), Verdict::Matched));
    }

    #[test]
    fn other_events_are_skipped() {
        let frame = Frame::server_event(Event::SENTENCE_START, Some("s".into()), &b"{}"[..]);
        assert!(matches!(started().check(&frame), Verdict::Skip));
        assert!(matches!(started().check(&Frame::audio("s", vec![1])), Verdict::Skip));
    }

    #[test]
    fn error_frames_fail_the_wait() {
        match started().check(&Frame::error(55_000_000, "quota exceeded")) {
            Verdict::Failed(UpstreamError::Provider { code, message }) => {
                assert_eq!(code, 55_000_000);
                assert_eq!(message, "quota exceeded");
            }
            other => panic!("expected provider failure, got {other:?}"),
        }
    }

    #[test]
    fn session_failed_fails_the_wait() {
        let frame = Frame::server_event(Event::SESSION_FAILED, Some("s".into()), &b"bad voice"[..]);
        assert!(matches!(
            started().check(&frame),
            Verdict::Failed(UpstreamError::Provider { .. })
        ));
    }

    /// Accept one socket, send `frames`, then hold the socket open.
    async fn serve_frames(frames: Vec<Frame>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            for frame in frames {
                ws.send(Message::Binary(frame.encode().unwrap())).await.unwrap();
            }
            while ws.next().await.is_some() {}
        });
        format!("ws://{addr}")
    }

    async fn connect(url: &str) -> UpstreamConnection {
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        UpstreamConnection::new(ws, "c-1")
    }

    #[tokio::test]
    async fn wait_for_drops_frames_until_match() {
        let url = serve_frames(vec![
            Frame::audio("stale", vec![0; 8]),
            Frame::server_event(Event::SENTENCE_END, Some("s".into()), &b"{}"[..]),
            Frame::server_event(Event::SESSION_STARTED, Some("s".into()), &b"{}"[..]),
        ])
        .await;
        let mut conn = connect(&url).await;

        let frame = conn.wait_for(started(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(frame.session_id.as_deref(), Some("s"));
    }

    #[tokio::test]
    async fn wait_for_times_out_with_dedicated_error() {
        let url = serve_frames(vec![Frame::audio("s", vec![0; 8])]).await;
        let mut conn = connect(&url).await;

        let err = conn
            .wait_for(started(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UpstreamError::EventTimeout {
                waiting_for: "SessionStarted",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn closed_socket_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.close(None).await.unwrap();
        });
        let mut conn = connect(&format!("ws://{addr}")).await;

        let err = conn.wait_for(started(), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Closed | UpstreamError::Transport(_)));
    }
}
