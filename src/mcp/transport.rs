//! Transport abstraction for the three MCP transport kinds named in spec
//! §4.3: a stdio child process, an outbound WebSocket client, and an
//! inbound WebSocket server that accepts connections. All three carry
//! newline/frame-delimited JSON-RPC 2.0 messages (spec §6).

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::AgentError;
use crate::mcp::protocol::JsonRpcInbound;

/// A bidirectional JSON-RPC carrier. Implementations push parsed inbound
/// messages onto the channel supplied at construction time and accept
/// outgoing raw JSON text via `send_line`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_line(&self, raw: String) -> Result<(), AgentError>;
    async fn close(&self) -> Result<(), AgentError>;
}

fn spawn_line_reader(
    mut lines: tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    inbound_tx: mpsc::UnboundedSender<JsonRpcInbound>,
) {
    tokio::spawn(async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Ok(parsed) = serde_json::from_str::<JsonRpcInbound>(&line) {
                        if inbound_tx.send(parsed).is_err() {
                            break;
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    });
}

/// Child-process stdio transport: newline-delimited JSON-RPC over the
/// spawned process's stdin/stdout.
pub struct StdioTransport {
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
}

impl StdioTransport {
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &[(String, String)],
        cwd: Option<&str>,
        inbound_tx: mpsc::UnboundedSender<JsonRpcInbound>,
    ) -> Result<Self, AgentError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        for (k, v) in env {
            cmd.env(k, v);
        }
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::network_error(format!("failed to spawn MCP server: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::network_error("child process has no stdout"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::network_error("child process has no stdin"))?;

        spawn_line_reader(BufReader::new(stdout).lines(), inbound_tx);

        Ok(Self {
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
        })
    }

    /// Whether the child process has exited, used by the reconnect logic
    /// to decide whether a stdio server needs respawning (spec §4.3).
    pub async fn has_exited(&self) -> bool {
        let mut child = self.child.lock().await;
        matches!(child.try_wait(), Ok(Some(_)))
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send_line(&self, raw: String) -> Result<(), AgentError> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(raw.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), AgentError> {
        let mut child = self.child.lock().await;
        let _ = child.start_kill();
        Ok(())
    }
}

fn spawn_ws_reader<S>(
    mut reader: futures_util::stream::SplitStream<WebSocketStream<S>>,
    inbound_tx: mpsc::UnboundedSender<JsonRpcInbound>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(Ok(msg)) = reader.next().await {
            if let WsMessage::Text(text) = msg {
                if let Ok(parsed) = serde_json::from_str::<JsonRpcInbound>(&text) {
                    if inbound_tx.send(parsed).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Outbound WebSocket client transport: one JSON object per text frame.
pub struct WsClientTransport {
    writer: Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>>,
}

impl WsClientTransport {
    pub async fn connect(
        url: &str,
        inbound_tx: mpsc::UnboundedSender<JsonRpcInbound>,
    ) -> Result<Self, AgentError> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| AgentError::network_error(e.to_string()))?;
        let (writer, reader) = ws_stream.split();
        spawn_ws_reader(reader, inbound_tx);
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }
}

#[async_trait]
impl Transport for WsClientTransport {
    async fn send_line(&self, raw: String) -> Result<(), AgentError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(WsMessage::Text(raw.into()))
            .await
            .map_err(|e| AgentError::network_error(e.to_string()))
    }

    async fn close(&self) -> Result<(), AgentError> {
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
        Ok(())
    }
}

/// One accepted connection of the inbound WebSocket server. Each
/// connection gets its own JSON-RPC pipe and is tracked as its own
/// `ServerConnection` by the manager (spec §5 "Shared resources").
pub struct WsServerConnectionTransport {
    writer: Mutex<SplitSink<WebSocketStream<TcpStream>, WsMessage>>,
}

impl WsServerConnectionTransport {
    pub async fn accept(
        listener: &TcpListener,
        inbound_tx: mpsc::UnboundedSender<JsonRpcInbound>,
    ) -> Result<Self, AgentError> {
        let (stream, _peer_addr) = listener
            .accept()
            .await
            .map_err(|e| AgentError::network_error(e.to_string()))?;
        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| AgentError::network_error(e.to_string()))?;
        let (writer, reader) = ws_stream.split();
        spawn_ws_reader(reader, inbound_tx);
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }
}

#[async_trait]
impl Transport for WsServerConnectionTransport {
    async fn send_line(&self, raw: String) -> Result<(), AgentError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(WsMessage::Text(raw.into()))
            .await
            .map_err(|e| AgentError::network_error(e.to_string()))
    }

    async fn close(&self) -> Result<(), AgentError> {
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
        Ok(())
    }
}

/// Binds the inbound capability-surface listener port (spec §4.3/§6).
pub async fn bind_inbound_listener(addr: &str) -> Result<TcpListener, AgentError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| AgentError::network_error(e.to_string()))
}
