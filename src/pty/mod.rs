//! PTY terminal session: requests an interactive shell on a
//! [`Chain`]'s target hop, bridges it to a caller-supplied transport (e.g. a
//! WebSocket), and fans stdin/stdout/stderr/exit in both directions.

pub mod batch;
pub mod buffer;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use russh::ChannelMsg;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chain::Chain;
use crate::error::{CoreError, Result};
use crate::lifecycle::Lifecycle;
use buffer::AdaptiveBuffer;

/// Hard-coded PTY modes: ECHO on, input/output speed fixed at 14400 baud.
/// Not exposed as caller-configurable knobs.
const PTY_TERM: &str = "xterm-256color";
const PTY_SPEED: u32 = 14400;

fn pty_modes() -> Vec<(russh::Pty, u32)> {
    vec![
        (russh::Pty::ECHO, 1),
        (russh::Pty::TTY_OP_ISPEED, PTY_SPEED),
        (russh::Pty::TTY_OP_OSPEED, PTY_SPEED),
    ]
}

/// Client-to-server and server-to-client wire messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Input { data: String },
    /// `data` carries the new geometry JSON-encoded as a string, e.g.
    /// `{"cols":80,"rows":24}`, rather than as nested fields.
    Resize { data: String },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ResizeGeometry {
    cols: u16,
    rows: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Output { data: String, timestamp: i64 },
    Status { data: String },
    Error { data: String },
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Transport abstraction over the caller's session-carrying protocol. The
/// concrete adapter used by this crate wraps an `axum` WebSocket; callers
/// embedding a different transport implement this trait directly.
#[async_trait]
pub trait TerminalTransport: Send {
    async fn recv(&mut self) -> Option<ClientMessage>;
    async fn send(&mut self, msg: ServerMessage) -> Result<()>;
}

/// `axum::extract::ws::WebSocket` adapter.
pub struct WebSocketTransport {
    socket: axum::extract::ws::WebSocket,
}

impl WebSocketTransport {
    pub fn new(socket: axum::extract::ws::WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl TerminalTransport for WebSocketTransport {
    async fn recv(&mut self) -> Option<ClientMessage> {
        use axum::extract::ws::Message;
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => match serde_json::from_str(&text) {
                    Ok(msg) => return Some(msg),
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping malformed terminal client message");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    }

    async fn send(&mut self, msg: ServerMessage) -> Result<()> {
        use axum::extract::ws::Message;
        let payload = serde_json::to_string(&msg)?;
        self.socket
            .send(Message::Text(payload.into()))
            .await
            .map_err(|e| CoreError::PtyRequest(e.to_string()))
    }
}

/// Cumulative counters for a PTY session, exposed for callers that want
/// to surface throughput or health in their own management endpoint.
#[derive(Debug, Default)]
pub struct PtyStats {
    pub bytes_in: std::sync::atomic::AtomicU64,
    pub bytes_out: std::sync::atomic::AtomicU64,
    pub error_count: std::sync::atomic::AtomicU64,
    pub last_active_ms: std::sync::atomic::AtomicI64,
}

impl PtyStats {
    fn touch(&self) {
        self.last_active_ms.store(now_millis(), Ordering::Relaxed);
    }
}

/// Drives one interactive shell session over a chain, bridging it to a
/// [`TerminalTransport`] until either side closes.
pub struct PtySession {
    chain: Arc<Chain>,
    lifecycle: Lifecycle,
    stats: Arc<PtyStats>,
}

impl PtySession {
    pub fn new(chain: Arc<Chain>) -> Self {
        Self {
            chain,
            lifecycle: Lifecycle::new(),
            stats: Arc::new(PtyStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PtyStats> {
        self.stats.clone()
    }

    /// Open the PTY, start a shell, and bridge it to `transport` until EOF,
    /// close, or cancellation. Returns once the session ends.
    pub async fn run(&self, mut transport: impl TerminalTransport, cols: u16, rows: u16) -> Result<()> {
        let mut channel = self.chain.new_session().await?;
        channel
            .request_pty(false, PTY_TERM, cols as u32, rows as u32, 0, 0, &pty_modes())
            .await
            .map_err(|e| CoreError::PtyRequest(e.to_string()))?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| CoreError::PtyRequest(e.to_string()))?;

        let read_buffer = AdaptiveBuffer::new_read();
        let write_buffer = Arc::new(AdaptiveBuffer::new_write());

        // stdout/stderr bytes flow: channel.wait() -> raw_tx -> batch::run
        // (coalesces) -> batched_tx -> this loop's transport.send. Only this
        // loop ever touches `transport`, so sends stay ordered.
        let (raw_tx, raw_rx) = mpsc::channel::<Vec<u8>>(256);
        let (batched_tx, mut batched_rx) = mpsc::channel::<Vec<u8>>(256);
        let batch_write_buffer = write_buffer.clone();
        let batch_stats = self.stats.clone();
        let batch_task = tokio::spawn(batch::run(raw_rx, move |chunk| {
            let batched_tx = batched_tx.clone();
            let write_buffer = batch_write_buffer.clone();
            let stats = batch_stats.clone();
            async move {
                write_buffer.record(chunk.len());
                stats.bytes_out.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                batched_tx.send(chunk).await.is_ok()
            }
        }));

        let _ = transport
            .send(ServerMessage::Status { data: "connected".into() })
            .await;

        let cancel = self.lifecycle.child_token();
        let result = self.bridge(&mut transport, &mut channel, raw_tx, &mut batched_rx, &read_buffer, cancel).await;

        drop(batched_rx);
        let _ = batch_task.await;

        if result.is_err() {
            self.stats.error_count.fetch_add(1, Ordering::Relaxed);
        }
        let _ = transport
            .send(ServerMessage::Status { data: "disconnected".into() })
            .await;
        result
    }

    async fn bridge(
        &self,
        transport: &mut impl TerminalTransport,
        channel: &mut russh::Channel<russh::client::Msg>,
        raw_tx: mpsc::Sender<Vec<u8>>,
        batched_rx: &mut mpsc::Receiver<Vec<u8>>,
        read_buffer: &AdaptiveBuffer,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = channel.eof().await;
                    break;
                }
                batched = batched_rx.recv() => {
                    match batched {
                        Some(bytes) => {
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            let msg = ServerMessage::Output { data: text, timestamp: now_millis() };
                            if transport.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                client_msg = transport.recv() => {
                    match client_msg {
                        Some(ClientMessage::Input { data }) => {
                            let bytes = data.into_bytes();
                            read_buffer.record(bytes.len());
                            self.stats.bytes_in.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                            self.stats.touch();
                            if channel.data(&bytes[..]).await.is_err() {
                                break;
                            }
                        }
                        Some(ClientMessage::Resize { data }) => {
                            match serde_json::from_str::<ResizeGeometry>(&data) {
                                Ok(geometry) => {
                                    let _ = channel.window_change(geometry.cols as u32, geometry.rows as u32, 0, 0).await;
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "dropping malformed resize message");
                                }
                            }
                        }
                        Some(ClientMessage::Ping) => {
                            let _ = transport.send(ServerMessage::Status { data: "pong".into() }).await;
                        }
                        None => {
                            let _ = channel.eof().await;
                            break;
                        }
                    }
                }
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) => {
                            self.stats.touch();
                            let _ = raw_tx.send(data.to_vec()).await;
                        }
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                            self.stats.touch();
                            let _ = raw_tx.send(data.to_vec()).await;
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            let _ = transport
                                .send(ServerMessage::Status { data: format!("exit:{exit_status}") })
                                .await;
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.lifecycle.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_roundtrip() {
        let msg = ClientMessage::Input { data: "ls\n".into() };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"input\""));
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, ClientMessage::Input { .. }));
    }

    #[test]
    fn resize_message_fields() {
        let msg = ClientMessage::Resize {
            data: r#"{"cols":80,"rows":24}"#.into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"resize","data":"{\"cols\":80,\"rows\":24}"}"#);
        let back: ClientMessage = serde_json::from_str(&json).unwrap();
        match back {
            ClientMessage::Resize { data } => {
                let geometry: ResizeGeometry = serde_json::from_str(&data).unwrap();
                assert_eq!(geometry.cols, 80);
                assert_eq!(geometry.rows, 24);
            }
            _ => panic!("expected resize"),
        }
    }

    #[test]
    fn server_message_serializes_tagged() {
        let msg = ServerMessage::Error { data: "boom".into() };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"error\""));
    }

    #[test]
    fn output_message_carries_timestamp() {
        let msg = ServerMessage::Output { data: "hi".into(), timestamp: 12345 };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"timestamp\":12345"));
    }

    #[test]
    fn ping_has_no_payload_field() {
        let json = serde_json::to_string(&ClientMessage::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }
}
