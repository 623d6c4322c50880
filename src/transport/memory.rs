//! In-process transport.
//!
//! `MemoryConnector` hands every new connection to a `MemoryServer`, which
//! plays the remote side. Used by the test suite and for local experiments
//! without a live endpoint.

use crate::error::{Result, VaasError};
use crate::transport::{Connector, FrameSink, FrameSource, Inbound, OutboundFrame, ReadError, Transport};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A frame as seen by the server side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Ping,
    Close,
}

/// Create a connected connector/server pair.
pub fn memory_transport() -> (MemoryConnector, MemoryServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let connects = Arc::new(AtomicUsize::new(0));
    (
        MemoryConnector {
            accept_tx,
            connects: connects.clone(),
        },
        MemoryServer {
            accept_rx,
            connects,
        },
    )
}

#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<ServerConnection>,
    connects: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Transport> {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        self.accept_tx
            .send(ServerConnection {
                incoming: client_rx,
                outgoing: server_tx,
            })
            .map_err(|_| VaasError::ConnectionFailed("memory server is not listening".into()))?;
        self.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Transport {
            sink: Box::new(MemorySink {
                tx: Some(client_tx),
            }),
            source: Box::new(MemorySource { rx: server_rx }),
        })
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<ClientFrame>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| VaasError::ConnectionLost("write half already closed".into()))?;
        let frame = match frame {
            OutboundFrame::Text(text) => ClientFrame::Text(text),
            OutboundFrame::Ping(_) => ClientFrame::Ping,
        };
        tx.send(frame)
            .map_err(|_| VaasError::ConnectionLost("server went away".into()))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(ClientFrame::Close);
        }
        Ok(())
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn next(&mut self) -> Option<std::result::Result<Inbound, ReadError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// Accepts the connections opened through the paired `MemoryConnector`.
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<ServerConnection>,
    connects: Arc<AtomicUsize>,
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.accept_rx.recv().await
    }

    /// Number of connections opened so far
    pub fn connection_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

/// Server end of one connection. Dropping it without `close` looks like an
/// abrupt transport loss to the client.
pub struct ServerConnection {
    incoming: mpsc::UnboundedReceiver<ClientFrame>,
    outgoing: mpsc::UnboundedSender<Inbound>,
}

impl ServerConnection {
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        self.incoming.recv().await
    }

    /// Next text frame. Pings are answered, a client close is acknowledged
    /// and ends the stream.
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.incoming.recv().await? {
                ClientFrame::Text(text) => return Some(text),
                ClientFrame::Ping => {
                    let _ = self.outgoing.send(Inbound::Pong);
                }
                ClientFrame::Close => {
                    self.close(1000);
                    return None;
                }
            }
        }
    }

    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).ok()
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outgoing.send(Inbound::Text(text.into())).is_ok()
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    pub fn close(&self, code: u16) {
        let _ = self.outgoing.send(Inbound::Closed {
            code: Some(code),
            reason: String::new(),
        });
    }

    /// Read the auth frame and accept it with `session_id`. Returns the token.
    pub async fn accept_auth(&mut self, session_id: &str) -> Option<String> {
        let request = self.recv_json().await?;
        let token = request["token"].as_str().unwrap_or_default().to_string();
        self.send_json(&json!({
            "kind": "AuthResponse",
            "session_id": session_id,
            "success": true,
        }));
        Some(token)
    }

    /// Read the auth frame and refuse it.
    pub async fn reject_auth(&mut self, text: &str) -> Option<()> {
        self.recv_json().await?;
        self.send_json(&json!({
            "kind": "AuthResponse",
            "success": false,
            "text": text,
        }));
        Some(())
    }
}
