use std::time::Duration;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use murmur_core::{SessionId, UpstreamCredentials};
use secrecy::ExposeSecret;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue};
use tracing::{debug, info, instrument, warn};

use crate::connection::{Expectation, UpstreamConnection, Verdict};
use crate::error::UpstreamError;
use crate::payload::{AudioParams, RequestTemplate};
use crate::protocol::{Event, Frame, MsgType};

/// Everything the driver needs to reach the provider.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub endpoint: String,
    pub credentials: UpstreamCredentials,
    /// Bound on every event wait, and on the gap between audio frames.
    pub event_timeout: Duration,
    pub audio: AudioParams,
    pub sentence_terminator: char,
}

impl DriverConfig {
    pub fn new(endpoint: impl Into<String>, credentials: UpstreamCredentials) -> Self {
        Self {
            endpoint: endpoint.into(),
            credentials,
            event_timeout: Duration::from_secs(10),
            audio: AudioParams::default(),
            sentence_terminator: '。',
        }
    }
}

/// Driver-side record of one text-to-speech request.
#[derive(Clone, Debug)]
pub struct SynthesisSession {
    pub id: SessionId,
    pub voice: String,
    /// One buffer per sentence that produced audio, in sentence order.
    pub sentence_audio: Vec<Bytes>,
    pub active: bool,
}

impl SynthesisSession {
    fn new(id: SessionId, voice: &str) -> Self {
        Self {
            id,
            voice: voice.to_owned(),
            sentence_audio: Vec::new(),
            active: true,
        }
    }

    fn concat(&self) -> Bytes {
        let total = self.sentence_audio.iter().map(Bytes::len).sum();
        let mut out = BytesMut::with_capacity(total);
        for chunk in &self.sentence_audio {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }
}

/// Removes a session that never reached the end of `synthesize`.
struct SessionGuard<'a> {
    sessions: &'a DashMap<SessionId, SynthesisSession>,
    id: SessionId,
    armed: bool,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.sessions.remove(&self.id);
        }
    }
}

/// Runs the provider's connect → session → task → finish protocol.
///
/// The driver owns session bookkeeping only; sockets belong to the caller,
/// which passes them in by `&mut` so one socket never serves two requests.
pub struct TtsDriver {
    config: DriverConfig,
    sessions: DashMap<SessionId, SynthesisSession>,
}

impl TtsDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, id: &SessionId) -> Option<SynthesisSession> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Open a provider socket and complete the StartConnection handshake.
    ///
    /// A socket whose handshake fails is closed here and never returned.
    #[instrument(skip(self))]
    pub async fn open_connection(
        &self,
        resource_id: &str,
        connect_id: &str,
    ) -> Result<UpstreamConnection, UpstreamError> {
        let timeout = self.config.event_timeout;
        let mut request = self
            .config
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;
        self.correlation_headers(request.headers_mut(), resource_id, connect_id)?;

        let (stream, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| UpstreamError::EventTimeout {
                waiting_for: "socket open",
                timeout,
            })?
            .map_err(|e| UpstreamError::Connect(e.to_string()))?;

        let mut conn = UpstreamConnection::new(stream, connect_id);
        match start_connection(&mut conn, timeout).await {
            Ok(()) => {
                info!("provider connection started");
                Ok(conn)
            }
            Err(e) => {
                warn!(error = %e, "provider handshake failed");
                conn.close().await;
                Err(UpstreamError::Handshake(Box::new(e)))
            }
        }
    }

    fn correlation_headers(
        &self,
        headers: &mut HeaderMap,
        resource_id: &str,
        connect_id: &str,
    ) -> Result<(), UpstreamError> {
        let creds = &self.config.credentials;
        let pairs: [(&'static str, &str); 5] = [
            ("x-api-app-key", creds.app_key.as_str()),
            ("x-api-access-key", creds.access_key.expose_secret()),
            ("x-api-resource-id", resource_id),
            ("x-api-connect-id", connect_id),
            ("x-control-require-usage-tokens-return", "true"),
        ];
        for (name, value) in pairs {
            let value = HeaderValue::from_str(value)
                .map_err(|_| UpstreamError::Connect(format!("invalid value for header {name}")))?;
            let _ = headers.insert(name, value);
        }
        Ok(())
    }

    /// Synthesize `text` sentence by sentence on `conn`.
    ///
    /// Empty input fails before anything is sent. On any error the session is
    /// discarded; on success it stays registered until [`finish`](Self::finish).
    #[instrument(skip(self, conn, text), fields(connect_id = %conn.connect_id(), chars = text.chars().count()))]
    pub async fn synthesize(
        &self,
        conn: &mut UpstreamConnection,
        text: &str,
        voice: &str,
    ) -> Result<SessionId, UpstreamError> {
        let sentences = split_sentences(text, self.config.sentence_terminator)?;

        let session_id = SessionId::new();
        let _ = self
            .sessions
            .insert(session_id.clone(), SynthesisSession::new(session_id.clone(), voice));
        let mut guard = SessionGuard {
            sessions: &self.sessions,
            id: session_id.clone(),
            armed: true,
        };

        let template = RequestTemplate::new(voice, &self.config.audio);
        for (index, sentence) in sentences.iter().enumerate() {
            let sentence_id = session_id.sentence(index);
            let audio = self
                .synthesize_sentence(conn, &sentence_id, sentence, &template)
                .await?;
            if audio.is_empty() {
                continue;
            }
            match self.sessions.get_mut(&session_id) {
                Some(mut session) => session.sentence_audio.push(audio),
                None => return Err(UpstreamError::SessionNotFound(session_id.to_string())),
            }
        }

        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            session.active = false;
        }
        guard.armed = false;
        debug!(%session_id, sentences = sentences.len(), "synthesis complete");
        Ok(session_id)
    }

    async fn synthesize_sentence(
        &self,
        conn: &mut UpstreamConnection,
        sentence_id: &SessionId,
        sentence: &str,
        template: &RequestTemplate<'_>,
    ) -> Result<Bytes, UpstreamError> {
        let timeout = self.config.event_timeout;

        conn.send(&Frame::start_session(sentence_id, template.start_session()))
            .await?;
        let _ = conn
            .wait_for(Expectation::server(Event::SESSION_STARTED), timeout)
            .await?;

        let mut utf8 = [0u8; 4];
        for ch in sentence.chars() {
            let text = ch.encode_utf8(&mut utf8);
            conn.send(&Frame::task_request(sentence_id, template.task_request(text)))
                .await?;
        }
        conn.send(&Frame::finish_session(sentence_id)).await?;

        let finished = Expectation::server(Event::SESSION_FINISHED);
        let mut audio = BytesMut::new();
        let mut chunks = 0usize;
        loop {
            let frame = conn
                .next_frame_within(timeout, finished.event.name())
                .await?;
            if frame.msg_type == MsgType::AudioOnlyServer {
                audio.extend_from_slice(&frame.payload);
                chunks += 1;
                continue;
            }
            match finished.check(&frame) {
                Verdict::Matched => break,
                Verdict::Failed(err) => return Err(err),
                Verdict::Skip => {}
            }
        }

        debug!(session_id = %sentence_id, chunks, bytes = audio.len(), "sentence finished");
        Ok(audio.freeze())
    }

    /// Hand back the concatenated audio and forget the session.
    pub fn finish(&self, session_id: &SessionId) -> Result<Bytes, UpstreamError> {
        let (_, session) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| UpstreamError::SessionNotFound(session_id.to_string()))?;
        if session.sentence_audio.is_empty() {
            return Err(UpstreamError::NoAudio);
        }
        Ok(session.concat())
    }

    /// Best-effort FinishConnection handshake, then close. Never fails.
    pub async fn close_connection(&self, mut conn: UpstreamConnection) {
        if let Err(e) = finish_connection(&mut conn, self.config.event_timeout).await {
            debug!(error = %e, connect_id = %conn.connect_id(), "provider finish handshake failed");
        }
        conn.close().await;
    }

    /// Forget a session. Unknown ids are ignored.
    pub fn cleanup_session(&self, session_id: &SessionId) {
        if self.sessions.remove(session_id).is_some() {
            debug!(%session_id, "session cleaned up");
        }
    }
}

async fn start_connection(
    conn: &mut UpstreamConnection,
    timeout: Duration,
) -> Result<(), UpstreamError> {
    conn.send(&Frame::start_connection()).await?;
    let _ = conn
        .wait_for(Expectation::server(Event::CONNECTION_STARTED), timeout)
        .await?;
    Ok(())
}

async fn finish_connection(
    conn: &mut UpstreamConnection,
    timeout: Duration,
) -> Result<(), UpstreamError> {
    conn.send(&Frame::finish_connection()).await?;
    let _ = conn
        .wait_for(Expectation::server(Event::CONNECTION_FINISHED), timeout)
        .await?;
    Ok(())
}

/// Split `text` into sentences on `terminator`.
///
/// Blank pieces are dropped. Text without a usable piece becomes one trimmed
/// sentence, and blank text is rejected.
pub fn split_sentences(text: &str, terminator: char) -> Result<Vec<String>, UpstreamError> {
    let sentences: Vec<String> = text
        .split(terminator)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_owned)
        .collect();
    if !sentences.is_empty() {
        return Ok(sentences);
    }
    match text.trim() {
        "" => Err(UpstreamError::EmptyText),
        trimmed => Ok(vec![trimmed.to_owned()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ConnectionReply, MockBehavior, MockProvider};
    use murmur_core::RelayError;

    fn config(url: String) -> DriverConfig {
        let mut config = DriverConfig::new(url, UpstreamCredentials::new("app", "key"));
        config.event_timeout = Duration::from_millis(500);
        config
    }

    #[test]
    fn split_on_terminator() {
        assert_eq!(split_sentences("你好。世界", '。').unwrap(), vec!["你好", "世界"]);
    }

    #[test]
    fn split_without_terminator_is_one_sentence() {
        assert_eq!(split_sentences("你好世界", '。').unwrap(), vec!["你好世界"]);
    }

    #[test]
    fn split_drops_blank_pieces() {
        assert_eq!(split_sentences("一。 。二。", '。').unwrap(), vec!["一", "二"]);
    }

    #[test]
    fn split_rejects_blank_text() {
        assert!(matches!(split_sentences("", '。'), Err(UpstreamError::EmptyText)));
        assert!(matches!(split_sentences("  \n\t", '。'), Err(UpstreamError::EmptyText)));
    }

    #[test]
    fn split_uses_configured_terminator() {
        assert_eq!(split_sentences("a. b", '.').unwrap(), vec!["a", " b"]);
    }

    #[test]
    fn session_guard_removes_only_while_armed() {
        let sessions = DashMap::new();
        let kept = SessionId::new();
        let dropped = SessionId::new();
        for id in [&kept, &dropped] {
            let _ = sessions.insert(id.clone(), SynthesisSession::new(id.clone(), "v"));
        }

        let mut guard = SessionGuard {
            sessions: &sessions,
            id: kept.clone(),
            armed: true,
        };
        guard.armed = false;
        drop(guard);
        drop(SessionGuard {
            sessions: &sessions,
            id: dropped.clone(),
            armed: true,
        });

        assert!(sessions.contains_key(&kept));
        assert!(!sessions.contains_key(&dropped));
    }

    #[test]
    fn cleanup_unknown_session_is_noop() {
        let driver = TtsDriver::new(config("ws://127.0.0.1:1".into()));
        driver.cleanup_session(&SessionId::new());
        assert_eq!(driver.active_sessions(), 0);
    }

    #[test]
    fn finish_unknown_session_fails() {
        let driver = TtsDriver::new(config("ws://127.0.0.1:1".into()));
        assert!(matches!(
            driver.finish(&SessionId::from_raw("tts_missing")),
            Err(UpstreamError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_text_fails_without_network() {
        let provider = MockProvider::start(MockBehavior::default()).await.unwrap();
        let driver = TtsDriver::new(config(provider.url()));
        let mut conn = driver.open_connection("res", "c-1").await.unwrap();

        let err = driver.synthesize(&mut conn, "   ", "v").await.unwrap_err();
        assert!(matches!(err, UpstreamError::EmptyText));
        assert_eq!(provider.sessions_started(), 0);
        assert_eq!(driver.active_sessions(), 0);
    }

    #[tokio::test]
    async fn open_connection_sends_correlation_headers() {
        let provider = MockProvider::start(MockBehavior::default()).await.unwrap();
        let driver = TtsDriver::new(config(provider.url()));
        let conn = driver.open_connection("volc.tts", "c-42").await.unwrap();
        assert_eq!(conn.connect_id(), "c-42");

        let headers = provider.last_headers().unwrap();
        assert_eq!(headers["x-api-app-key"], "app");
        assert_eq!(headers["x-api-access-key"], "key");
        assert_eq!(headers["x-api-resource-id"], "volc.tts");
        assert_eq!(headers["x-api-connect-id"], "c-42");
        assert_eq!(headers["x-control-require-usage-tokens-return"], "true");
    }

    #[tokio::test]
    async fn synthesize_collects_audio_per_sentence() {
        let behavior = MockBehavior {
            audio_per_char: 100,
            ..MockBehavior::default()
        };
        let provider = MockProvider::start(behavior).await.unwrap();
        let driver = TtsDriver::new(config(provider.url()));
        let mut conn = driver.open_connection("res", "c-1").await.unwrap();

        let id = driver.synthesize(&mut conn, "你好。世界啊", "v").await.unwrap();
        let session = driver.session(&id).unwrap();
        assert!(!session.active);
        assert_eq!(session.sentence_audio.len(), 2);
        assert_eq!(session.sentence_audio[0].len(), 200);
        assert_eq!(session.sentence_audio[1].len(), 300);

        let audio = driver.finish(&id).unwrap();
        assert_eq!(audio.len(), 500);
        assert_eq!(driver.active_sessions(), 0);

        assert_eq!(provider.sessions_started(), 2);
        assert_eq!(provider.task_requests(), 5);
    }

    #[tokio::test]
    async fn socket_is_reusable_across_requests() {
        let behavior = MockBehavior {
            audio_per_char: 10,
            ..MockBehavior::default()
        };
        let provider = MockProvider::start(behavior).await.unwrap();
        let driver = TtsDriver::new(config(provider.url()));
        let mut conn = driver.open_connection("res", "c-1").await.unwrap();

        for text in ["一", "二三"] {
            let id = driver.synthesize(&mut conn, text, "v").await.unwrap();
            let _ = driver.finish(&id).unwrap();
        }
        assert_eq!(provider.connections(), 1);
    }

    #[tokio::test]
    async fn silent_provider_yields_no_audio() {
        let provider = MockProvider::start(MockBehavior::default()).await.unwrap();
        let driver = TtsDriver::new(config(provider.url()));
        let mut conn = driver.open_connection("res", "c-1").await.unwrap();

        let id = driver.synthesize(&mut conn, "你好", "v").await.unwrap();
        assert!(matches!(driver.finish(&id), Err(UpstreamError::NoAudio)));
        assert_eq!(driver.active_sessions(), 0);
    }

    #[tokio::test]
    async fn rejected_connection_is_a_handshake_failure() {
        let behavior = MockBehavior {
            connection: ConnectionReply::Reject,
            ..MockBehavior::default()
        };
        let provider = MockProvider::start(behavior).await.unwrap();
        let driver = TtsDriver::new(config(provider.url()));

        let err = driver.open_connection("res", "c-1").await.unwrap_err();
        match &err {
            UpstreamError::Handshake(inner) => {
                assert!(matches!(**inner, UpstreamError::Provider { .. }));
            }
            other => panic!("expected handshake failure, got {other:?}"),
        }
        assert!(err.poisons_connection());
        assert!(matches!(RelayError::from(err), RelayError::UpstreamConnection(_)));
    }

    #[tokio::test]
    async fn unresponsive_provider_times_out() {
        let behavior = MockBehavior {
            connection: ConnectionReply::Ignore,
            ..MockBehavior::default()
        };
        let provider = MockProvider::start(behavior).await.unwrap();
        let driver = TtsDriver::new(config(provider.url()));

        let err = driver.open_connection("res", "c-1").await.unwrap_err();
        let UpstreamError::Handshake(inner) = err else {
            panic!("expected handshake failure, got {err:?}");
        };
        assert!(matches!(
            *inner,
            UpstreamError::EventTimeout {
                waiting_for: "ConnectionStarted",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unreachable_provider_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let driver = TtsDriver::new(config(format!("ws://{addr}")));

        let err = driver.open_connection("res", "c-1").await.unwrap_err();
        assert!(matches!(err, UpstreamError::Connect(_)));
    }

    #[tokio::test]
    async fn stalled_session_times_out_and_discards_session() {
        let behavior = MockBehavior {
            audio_per_char: 10,
            finish_delay: Duration::from_secs(5),
            ..MockBehavior::default()
        };
        let provider = MockProvider::start(behavior).await.unwrap();
        let driver = TtsDriver::new(config(provider.url()));
        let mut conn = driver.open_connection("res", "c-1").await.unwrap();

        let err = driver.synthesize(&mut conn, "你好", "v").await.unwrap_err();
        assert!(matches!(err, UpstreamError::EventTimeout { .. }));
        assert_eq!(driver.active_sessions(), 0);
    }

    #[tokio::test]
    async fn close_connection_completes_handshake() {
        let provider = MockProvider::start(MockBehavior::default()).await.unwrap();
        let driver = TtsDriver::new(config(provider.url()));
        let conn = driver.open_connection("res", "c-1").await.unwrap();

        driver.close_connection(conn).await;
        assert_eq!(provider.connections_finished(), 1);
    }
}
