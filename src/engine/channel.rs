//! Shared types for the connection engine.
//!
//! Callers -> outbound queue -> Writer Pump -> transport
//! transport -> Reader Pump -> correlation table -> callers
//! Connection state is published through a `watch` channel.

use crate::engine::protocol::VerdictResponse;
use crate::error::{Result, VaasError};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Payload of the keepalive ping
pub const KEEPALIVE_PAYLOAD: &[u8] = b"vaas";

// =============================================================================
// Outbound queue: callers -> Writer Pump
// =============================================================================

pub type OutboundSender = mpsc::Sender<String>;
pub type OutboundReceiver = mpsc::Receiver<String>;

/// Bounded queue of encoded request frames.
pub fn outbound_channel(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    mpsc::channel(capacity)
}

// =============================================================================
// Connection state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Draining,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Draining => "draining",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// An authenticated connection. Requests enqueued here are written by the
/// Writer Pump of that connection only.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    outbound: OutboundSender,
}

impl Session {
    pub fn new(id: impl Into<String>, outbound: OutboundSender) -> Self {
        Self {
            id: id.into(),
            outbound,
        }
    }

    /// Enqueue one encoded frame. Fails once the Writer Pump is gone.
    pub async fn submit(&self, frame: String) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| VaasError::ConnectionLost(format!("session {} is gone", self.id)))
    }
}

/// Snapshot published by the supervisor.
#[derive(Debug, Clone)]
pub struct Link {
    pub state: ConnectionState,

    /// Set only while `Ready`
    pub session: Option<Arc<Session>>,

    /// Why the engine stopped for good, if it did not stop by `close`
    pub terminal: Option<Failure>,

    /// Whether a first connection ever succeeded
    pub connected: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            session: None,
            terminal: None,
            connected: false,
        }
    }
}

pub fn link_channel() -> (watch::Sender<Link>, watch::Receiver<Link>) {
    watch::channel(Link::default())
}

// =============================================================================
// Replies: Reader Pump / supervisor -> callers
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transport dropped with the request in flight
    ConnectionLost,
    /// Engine closed with the request in flight
    Shutdown,
    /// Server flagged the request as faulty
    Client,
    /// Server failed to process the request
    Server,
    /// Reply carried the request id but could not be validated
    InvalidResponse,
    /// Server refused the credentials during reconnect
    Authentication,
}

/// Synthetic `Error` resolution of a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ConnectionLost, message)
    }

    pub fn shutdown() -> Self {
        Self::new(FailureKind::Shutdown, "engine closed before a reply arrived")
    }

    pub fn into_error(self) -> VaasError {
        match self.kind {
            FailureKind::ConnectionLost => VaasError::ConnectionLost(self.message),
            FailureKind::Shutdown => VaasError::InvalidOperation(self.message),
            FailureKind::Client => VaasError::Client(self.message),
            FailureKind::Server => VaasError::Server(self.message),
            FailureKind::InvalidResponse => VaasError::InvalidResponse(self.message),
            FailureKind::Authentication => VaasError::AuthenticationFailed(self.message),
        }
    }
}

/// What a reply slot receives.
#[derive(Debug, Clone)]
pub enum Reply {
    Verdict(VerdictResponse),
    Failed(Failure),
}

// =============================================================================
// Pump termination
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pump {
    Writer,
    Reader,
}

/// Why a pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Orderly close from either side
    Graceful,
    Abrupt(String),
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Graceful => f.write_str("closed"),
            Termination::Abrupt(reason) => write!(f, "lost: {}", reason),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_submit_fails_after_writer_exit() {
        let (tx, mut rx) = outbound_channel(4);
        let session = Session::new("s1", tx);

        session.submit("frame".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("frame"));

        drop(rx);
        assert!(matches!(
            session.submit("late".to_string()).await,
            Err(VaasError::ConnectionLost(_))
        ));
    }

    #[test]
    fn test_failure_maps_to_error() {
        assert!(matches!(
            Failure::connection_lost("eof").into_error(),
            VaasError::ConnectionLost(_)
        ));
        assert!(matches!(
            Failure::new(FailureKind::Client, "bad").into_error(),
            VaasError::Client(_)
        ));
        assert!(matches!(
            Failure::new(FailureKind::Authentication, "denied").into_error(),
            VaasError::AuthenticationFailed(_)
        ));
    }

    #[test]
    fn test_default_link() {
        let link = Link::default();
        assert_eq!(link.state, ConnectionState::Disconnected);
        assert!(link.session.is_none());
        assert!(!link.connected);
    }
}
