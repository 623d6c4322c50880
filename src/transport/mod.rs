//! Transport abstraction - a persistent, message-oriented, bidirectional
//! connection split into a write half and a read half.
//!
//! Each half is owned by exactly one pump task. Protocol handling lives in
//! `engine`; transports only move frames.

pub mod memory;
pub mod websocket;

use crate::error::Result;
use async_trait::async_trait;
use thiserror::Error;

pub use memory::{memory_transport, MemoryConnector, MemoryServer, ServerConnection};
pub use websocket::WebSocketConnector;

/// Close codes that count as an orderly shutdown (normal, going away, no status)
pub const NORMAL_CLOSE_CODES: [u16; 3] = [1000, 1001, 1005];

/// Frame written by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// Keepalive probe
    Ping(Vec<u8>),
}

/// Frame read by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Pong,
    Closed { code: Option<u16>, reason: String },
}

impl Inbound {
    pub fn is_orderly_close(&self) -> bool {
        match self {
            Inbound::Closed { code: None, .. } => true,
            Inbound::Closed {
                code: Some(code), ..
            } => NORMAL_CLOSE_CODES.contains(code),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ReadError {
    /// Garbled frame; the connection itself is still usable
    #[error("malformed frame: {0}")]
    Transient(String),

    #[error("transport failed: {0}")]
    Fatal(String),
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: OutboundFrame) -> Result<()>;

    /// Send a close frame and release the write half.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait FrameSource: Send {
    /// `None` once the peer is gone without a close frame.
    async fn next(&mut self) -> Option<std::result::Result<Inbound, ReadError>>;
}

/// An open connection, ready to be split between the two pumps.
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// Opens a fresh transport per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Transport>;
}
