//! Client connection lifecycle: admission, authentication, request dispatch
//! and the single teardown path.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use murmur_core::{ConnectionId, RelayError, TokenVerifier};
use murmur_telemetry::RelayMetrics;
use murmur_upstream::{TtsDriver, UpstreamConnection, UpstreamError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::admission::AdmissionController;
use crate::codec::{self, ClientMessage, ServerMessage, AUDIO_HEADER_LEN};
use crate::connection::{ClientConnection, Correlation};
use crate::registry::ConnectionRegistry;

/// Why a request ended early.
enum RequestError {
    Relay(RelayError),
    Upstream(UpstreamError),
    /// The client went away; nobody is left to tell.
    ClientGone,
}

impl From<RelayError> for RequestError {
    fn from(err: RelayError) -> Self {
        Self::Relay(err)
    }
}

impl From<UpstreamError> for RequestError {
    fn from(err: UpstreamError) -> Self {
        Self::Upstream(err)
    }
}

pub struct Gateway {
    admission: AdmissionController,
    registry: ConnectionRegistry,
    driver: Arc<TtsDriver>,
    verifier: Arc<dyn TokenVerifier>,
    metrics: Arc<RelayMetrics>,
    send_queue: usize,
}

impl Gateway {
    pub fn new(
        max_connections: usize,
        send_queue: usize,
        driver: Arc<TtsDriver>,
        verifier: Arc<dyn TokenVerifier>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            admission: AdmissionController::new(max_connections),
            registry: ConnectionRegistry::new(),
            driver,
            verifier,
            metrics,
            send_queue: send_queue.max(1),
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn driver(&self) -> &Arc<TtsDriver> {
        &self.driver
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    /// Serve one upgraded client socket until it closes or is torn down.
    pub async fn accept(self: Arc<Self>, mut socket: WebSocket) {
        if !self.admission.acquire() {
            self.metrics.connection_rejected();
            let err = RelayError::AdmissionRejected {
                max: self.admission.max(),
            };
            warn!(max = self.admission.max(), "connection rejected at capacity");
            let rejection = Message::Text(ServerMessage::error(&err).to_json().into());
            let _ = socket.send(rejection).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }

        let (tx, rx) = mpsc::channel(self.send_queue);
        let conn = self.registry.register(tx);
        self.metrics.connection_accepted();
        info!(
            connection_id = %conn.id,
            ordinal = conn.ordinal,
            connections = self.registry.len(),
            "client connected"
        );

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(write_loop(sink, rx, conn.cancel_token()));

        self.read_loop(&conn, stream).await;
        let _ = self.teardown(&conn.id, "client disconnected");
        let _ = writer.await;
    }

    async fn read_loop(self: &Arc<Self>, conn: &Arc<ClientConnection>, mut stream: SplitStream<WebSocket>) {
        let cancel = conn.cancel_token();
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(Message::Text(text))) => self.handle_text(conn, text.as_str()).await,
                Some(Ok(Message::Binary(data))) => self.handle_binary(conn, &data).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => conn.touch(),
                Some(Err(e)) => {
                    debug!(connection_id = %conn.id, error = %e, "client socket error");
                    break;
                }
            }
        }
    }

    async fn handle_binary(self: &Arc<Self>, conn: &Arc<ClientConnection>, data: &[u8]) {
        if codec::is_audio_frame(data) {
            conn.touch();
            warn!(connection_id = %conn.id, bytes = data.len(), "ignoring audio frame from client");
            return;
        }
        match std::str::from_utf8(data) {
            Ok(text) => self.handle_text(conn, text).await,
            Err(_) => {
                conn.touch();
                let err = RelayError::Protocol("binary frame is neither audio nor UTF-8 JSON".into());
                self.report(conn, &err).await;
            }
        }
    }

    async fn handle_text(self: &Arc<Self>, conn: &Arc<ClientConnection>, raw: &str) {
        conn.touch();
        let message = match codec::parse_client_message(raw) {
            Ok(message) => message,
            Err(err) => return self.report(conn, &err).await,
        };
        match message {
            ClientMessage::Auth {
                token,
                resource_id,
                connect_id,
            } => self.handle_auth(conn, token, resource_id, connect_id).await,
            ClientMessage::Tts {
                text,
                voice,
                connect_id,
            } => {
                self.handle_tts(
                    conn,
                    text.unwrap_or_default(),
                    voice.unwrap_or_default(),
                    connect_id.unwrap_or_default(),
                )
                .await;
            }
        }
    }

    async fn handle_auth(
        &self,
        conn: &ClientConnection,
        token: Option<String>,
        resource_id: Option<String>,
        connect_id: Option<String>,
    ) {
        if conn.is_authenticated() {
            let err = RelayError::Protocol("connection is already authenticated".into());
            return self.report(conn, &err).await;
        }

        let present = |v: Option<String>| v.filter(|s| !s.is_empty());
        let (Some(token), Some(resource_id), Some(connect_id)) =
            (present(token), present(resource_id), present(connect_id))
        else {
            return self
                .reject_auth(conn, "token, resourceId and connectId are required")
                .await;
        };

        let identity = match self.verifier.verify(&token).await {
            Ok(identity) => identity,
            Err(e) => return self.reject_auth(conn, &e.to_string()).await,
        };
        let uid = identity.uid.clone();
        let correlation = Correlation {
            resource_id,
            connect_id,
        };
        if let Err(err) = conn.authenticate(identity, correlation.clone()) {
            return self.report(conn, &err).await;
        }

        info!(
            connection_id = %conn.id,
            uid = %uid,
            resource_id = %correlation.resource_id,
            connect_id = %correlation.connect_id,
            "client authenticated"
        );
        let _ = conn.send_control(&ServerMessage::Auth).await;
    }

    async fn reject_auth(&self, conn: &ClientConnection, reason: &str) {
        self.metrics.auth_failed();
        let err = RelayError::AuthenticationFailed(reason.to_owned());
        self.report(conn, &err).await;
    }

    async fn handle_tts(
        self: &Arc<Self>,
        conn: &Arc<ClientConnection>,
        text: String,
        voice: String,
        connect_id: String,
    ) {
        let correlation = match conn.begin_request(&connect_id) {
            Ok(correlation) => correlation,
            Err(err) => return self.report(conn, &err).await,
        };

        let uid = conn.identity().map(|identity| identity.uid).unwrap_or_default();
        let span = info_span!(
            "tts_request",
            connection_id = %conn.id,
            ordinal = conn.ordinal,
            uid = %uid
        );
        let gateway = Arc::clone(self);
        let conn = Arc::clone(conn);
        let _ = tokio::spawn(
            async move { gateway.run_request(conn, text, voice, correlation).await }.instrument(span),
        );
    }

    /// Body of the per-request task.
    ///
    /// The connection is back to idle, with its upstream socket parked,
    /// before the closing `backend-end` or `backend-error` is queued, so a
    /// client may send its next request as soon as it sees either.
    async fn run_request(
        &self,
        conn: Arc<ClientConnection>,
        text: String,
        voice: String,
        correlation: Correlation,
    ) {
        let cancel = conn.cancel_token();
        let mut upstream = conn.take_upstream();

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RequestError::ClientGone),
            result = self.relay(&conn, &mut upstream, &text, &voice, &correlation) => result,
        };

        let keep_upstream = match &outcome {
            Err(RequestError::Upstream(err)) => !err.poisons_connection(),
            _ => true,
        };
        if let Some(session) = conn.take_active_session() {
            self.driver.cleanup_session(&session);
        }
        if let Some(socket) = upstream.take() {
            let leftover = if keep_upstream {
                conn.restore_upstream(socket)
            } else {
                Some(socket)
            };
            if let Some(socket) = leftover {
                self.close_upstream(socket);
            }
        }
        conn.end_request();

        match outcome {
            Ok(()) => {
                if conn.send_control(&ServerMessage::End).await {
                    self.metrics.request_completed();
                }
            }
            Err(RequestError::ClientGone) => debug!("request abandoned, client gone"),
            Err(RequestError::Upstream(err)) => self.fail_request(&conn, err.into()).await,
            Err(RequestError::Relay(err)) => self.fail_request(&conn, err).await,
        }
    }

    async fn relay(
        &self,
        conn: &ClientConnection,
        upstream: &mut Option<UpstreamConnection>,
        text: &str,
        voice: &str,
        correlation: &Correlation,
    ) -> Result<(), RequestError> {
        if text.trim().is_empty() {
            return Err(UpstreamError::EmptyText.into());
        }
        if upstream.is_none() {
            let opened = self
                .driver
                .open_connection(&correlation.resource_id, &correlation.connect_id)
                .await?;
            *upstream = Some(opened);
        }
        let Some(socket) = upstream.as_mut() else {
            return Err(UpstreamError::Closed.into());
        };

        let session_id = self.driver.synthesize(socket, text, voice).await?;
        conn.set_active_session(session_id.clone());
        let audio = self.driver.finish(&session_id)?;

        let mut frames = 0usize;
        for frame in codec::audio_frames(&audio) {
            let payload_len = frame.len() - AUDIO_HEADER_LEN;
            if !conn.send(Message::Binary(frame)).await {
                return Err(RequestError::ClientGone);
            }
            self.metrics.audio_frame_sent(payload_len);
            frames += 1;
        }

        info!(%session_id, bytes = audio.len(), frames, "synthesis delivered");
        Ok(())
    }

    async fn fail_request(&self, conn: &ClientConnection, err: RelayError) {
        self.metrics.request_failed();
        self.report(conn, &err).await;
    }

    /// Log a failure and tell the client, if it is still listening.
    /// Terminal errors then tear the connection down.
    async fn report(&self, conn: &ClientConnection, err: &RelayError) {
        warn!(
            connection_id = %conn.id,
            ordinal = conn.ordinal,
            error_kind = err.error_kind(),
            error = %err,
            "client request failed"
        );
        if !conn.send_control(&ServerMessage::error(err)).await {
            debug!(connection_id = %conn.id, "error not delivered, client writer is gone");
        }
        if err.is_terminal() {
            let _ = self.teardown(&conn.id, err.error_kind());
        }
    }

    fn close_upstream(&self, socket: UpstreamConnection) {
        let driver = Arc::clone(&self.driver);
        let _ = tokio::spawn(async move { driver.close_connection(socket).await });
    }

    /// Release everything a connection holds. Returns false if it was already gone.
    ///
    /// Every exit path funnels through here; the registry removal decides
    /// which caller does the work, so repeated calls are harmless.
    pub fn teardown(&self, id: &ConnectionId, reason: &str) -> bool {
        let Some(conn) = self.registry.remove(id) else {
            return false;
        };
        conn.close();
        if let Some(socket) = conn.take_upstream() {
            self.close_upstream(socket);
        }
        if let Some(session) = conn.take_active_session() {
            self.driver.cleanup_session(&session);
        }
        self.admission.release();
        info!(
            connection_id = %id,
            ordinal = conn.ordinal,
            reason,
            connections = self.registry.len(),
            "connection closed"
        );
        true
    }

    /// Notify without waiting, then tear down.
    pub fn evict(&self, id: &ConnectionId, err: &RelayError) -> bool {
        let Some(conn) = self.registry.get(id) else {
            return false;
        };
        warn!(connection_id = %id, ordinal = conn.ordinal, error = %err, "evicting connection");
        if !conn.try_send_control(&ServerMessage::error(err)) {
            warn!(
                connection_id = %id,
                error_kind = err.error_kind(),
                "eviction notice dropped, outbound queue full or closed"
            );
        }
        let evicted = self.teardown(id, err.error_kind());
        if evicted {
            self.metrics.connection_evicted();
        }
        evicted
    }

    /// Tear down every tracked connection.
    pub fn shutdown(&self) -> usize {
        let ids = self.registry.ids();
        let closed = ids
            .iter()
            .filter(|id| self.teardown(id, "server shutdown"))
            .count();
        info!(closed, "gateway shut down");
        closed
    }
}

/// Forward queued frames to the socket. On cancellation, flush what is
/// already queued, then close.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            message = rx.recv() => match message {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        return;
                    }
                }
                None => break,
            },
            () = cancel.cancelled() => {
                while let Ok(message) = rx.try_recv() {
                    if sink.send(message).await.is_err() {
                        return;
                    }
                }
                break;
            }
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}
