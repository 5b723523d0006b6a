//! In-process stand-in for the synthesis provider.
//!
//! Speaks the real frame format over a loopback websocket so the driver and
//! the gateway can be exercised end to end without network access.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::UpstreamError;
use crate::protocol::{Event, Frame};

const AUDIO_CHUNK: usize = 4096;

/// How the mock answers StartConnection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionReply {
    #[default]
    Accept,
    /// Answer with ConnectionFailed.
    Reject,
    /// Never answer.
    Ignore,
}

#[derive(Clone, Debug, Default)]
pub struct MockBehavior {
    /// Audio bytes produced per submitted character. Zero means no audio at all.
    pub audio_per_char: usize,
    pub connection: ConnectionReply,
    /// Pause before answering each FinishSession.
    pub finish_delay: Duration,
}

#[derive(Default)]
struct Stats {
    connections: AtomicUsize,
    sessions_started: AtomicUsize,
    task_requests: AtomicUsize,
    connections_finished: AtomicUsize,
    last_headers: Mutex<Option<HashMap<String, String>>>,
}

/// A running mock provider. Stops accepting when dropped.
pub struct MockProvider {
    addr: SocketAddr,
    stats: Arc<Stats>,
    accept_task: JoinHandle<()>,
}

impl MockProvider {
    pub async fn start(behavior: MockBehavior) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let stats = Arc::new(Stats::default());

        let accept_stats = Arc::clone(&stats);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let stats = Arc::clone(&accept_stats);
                let behavior = behavior.clone();
                let _ = tokio::spawn(async move {
                    if let Err(e) = serve(stream, behavior, stats).await {
                        debug!(error = %e, "mock provider connection ended");
                    }
                });
            }
        });

        Ok(Self {
            addr,
            stats,
            accept_task,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Sockets that completed the websocket upgrade.
    pub fn connections(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    pub fn sessions_started(&self) -> usize {
        self.stats.sessions_started.load(Ordering::SeqCst)
    }

    pub fn task_requests(&self) -> usize {
        self.stats.task_requests.load(Ordering::SeqCst)
    }

    pub fn connections_finished(&self) -> usize {
        self.stats.connections_finished.load(Ordering::SeqCst)
    }

    /// Upgrade request headers of the most recent socket, names lowercased.
    pub fn last_headers(&self) -> Option<HashMap<String, String>> {
        self.stats.last_headers.lock().clone()
    }
}

impl Drop for MockProvider {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    behavior: MockBehavior,
    stats: Arc<Stats>,
) -> Result<(), UpstreamError> {
    let header_stats = Arc::clone(&stats);
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, move |req: &Request, resp: Response| {
        let headers = req
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_owned(), v.to_str().unwrap_or_default().to_owned()))
            .collect();
        *header_stats.last_headers.lock() = Some(headers);
        Ok(resp)
    })
    .await?;
    let _ = stats.connections.fetch_add(1, Ordering::SeqCst);

    let mut chars = 0usize;
    while let Some(message) = ws.next().await {
        let data = match message? {
            Message::Binary(data) => data,
            Message::Close(_) => break,
            _ => continue,
        };
        let frame = match Frame::decode(&data) {
            Ok(frame) => frame,
            Err(e) => {
                send_frame(&mut ws, Frame::error(45_000_000, e.to_string())).await?;
                continue;
            }
        };
        let Some(event) = frame.event else { continue };

        match event {
            Event::START_CONNECTION => match behavior.connection {
                ConnectionReply::Accept => {
                    send_frame(
                        &mut ws,
                        Frame::server_event(
                            Event::CONNECTION_STARTED,
                            Some("mock-connection".into()),
                            &b"{}"[..],
                        ),
                    )
                    .await?;
                }
                ConnectionReply::Reject => {
                    send_frame(
                        &mut ws,
                        Frame::server_event(
                            Event::CONNECTION_FAILED,
                            Some("mock-connection".into()),
                            &br#"{"status_code":45000001,"message":"invalid resource"}"#[..],
                        ),
                    )
                    .await?;
                }
                ConnectionReply::Ignore => {}
            },
            Event::START_SESSION => {
                let _ = stats.sessions_started.fetch_add(1, Ordering::SeqCst);
                chars = 0;
                send_frame(
                    &mut ws,
                    Frame::server_event(
                        Event::SESSION_STARTED,
                        frame.session_id.clone(),
                        &b"{}"[..],
                    ),
                )
                .await?;
            }
            Event::TASK_REQUEST => {
                let _ = stats.task_requests.fetch_add(1, Ordering::SeqCst);
                chars += 1;
            }
            Event::FINISH_SESSION => {
                if !behavior.finish_delay.is_zero() {
                    tokio::time::sleep(behavior.finish_delay).await;
                }
                let session_id = frame.session_id.clone().unwrap_or_default();
                send_frame(
                    &mut ws,
                    Frame::server_event(
                        Event::SENTENCE_START,
                        Some(session_id.clone()),
                        &b"{}"[..],
                    ),
                )
                .await?;
                let audio = pcm(chars * behavior.audio_per_char);
                for chunk in audio.chunks(AUDIO_CHUNK) {
                    send_frame(&mut ws, Frame::audio(session_id.clone(), chunk.to_vec()))
                        .await?;
                }
                send_frame(
                    &mut ws,
                    Frame::server_event(
                        Event::SESSION_FINISHED,
                        Some(session_id),
                        &b"{}"[..],
                    ),
                )
                .await?;
            }
            Event::FINISH_CONNECTION => {
                let _ = stats.connections_finished.fetch_add(1, Ordering::SeqCst);
                send_frame(
                    &mut ws,
                    Frame::server_event(
                        Event::CONNECTION_FINISHED,
                        Some("mock-connection".into()),
                        &b"{}"[..],
                    ),
                )
                .await?;
            }
            _ => {}
        }
    }
    Ok(())
}

async fn send_frame(ws: &mut WebSocketStream<TcpStream>, frame: Frame) -> Result<(), UpstreamError> {
    ws.send(Message::Binary(frame.encode()?)).await?;
    Ok(())
}

/// Deterministic byte ramp so reassembled audio can be checked for order.
pub fn pcm(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
