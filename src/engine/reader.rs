//! Reader Pump - the only task that reads from a connection.
//!
//! Decodes inbound frames and resolves correlation entries. Replies with an
//! unknown id are dropped; they are expected after cancellations.

use crate::engine::channel::{Failure, FailureKind, Reply, Termination};
use crate::engine::correlation::CorrelationTable;
use crate::engine::protocol::{ErrorMessage, ServerFrame, VerdictResponse};
use crate::transport::{FrameSource, Inbound, ReadError};
use std::sync::Arc;
use std::time::Duration;

pub struct ReaderPump {
    source: Box<dyn FrameSource>,
    table: Arc<CorrelationTable>,
    read_timeout: Duration,
}

impl ReaderPump {
    pub fn new(
        source: Box<dyn FrameSource>,
        table: Arc<CorrelationTable>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            source,
            table,
            read_timeout,
        }
    }

    pub async fn run(mut self) -> Termination {
        loop {
            let next = match tokio::time::timeout(self.read_timeout, self.source.next()).await {
                Ok(next) => next,
                Err(_) => {
                    return Termination::Abrupt(format!(
                        "no frame received within {:?}",
                        self.read_timeout
                    ))
                }
            };

            match next {
                None => {
                    return Termination::Abrupt("connection dropped without close frame".into())
                }
                Some(Err(ReadError::Transient(reason))) => {
                    tracing::warn!("skipping frame: {}", reason);
                }
                Some(Err(ReadError::Fatal(reason))) => return Termination::Abrupt(reason),
                Some(Ok(Inbound::Pong)) => tracing::trace!("keepalive answered"),
                Some(Ok(closed)) if closed.is_orderly_close() => return Termination::Graceful,
                Some(Ok(Inbound::Closed { code, reason })) => {
                    return Termination::Abrupt(format!("closed with code {:?}: {}", code, reason))
                }
                Some(Ok(Inbound::Text(text))) => self.dispatch(&text),
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match ServerFrame::decode(text) {
            Ok(ServerFrame::Verdict(response)) => self.on_verdict(response),
            Ok(ServerFrame::Error(error)) => self.on_error(error),
            Ok(ServerFrame::Auth(_)) => {
                tracing::warn!("dropping auth response on an authenticated connection")
            }
            Ok(ServerFrame::Other(kind)) => tracing::debug!(%kind, "ignoring frame"),
            Err(e) => tracing::warn!("dropping frame: {}", e),
        }
    }

    fn on_verdict(&self, response: VerdictResponse) {
        if response.guid.is_empty() {
            tracing::warn!("dropping verdict response without request id");
            return;
        }
        let guid = response.guid.clone();
        let reply = if response.is_valid() {
            tracing::debug!(%guid, verdict = %response.verdict, "verdict received");
            Reply::Verdict(response)
        } else {
            tracing::warn!(%guid, verdict = %response.verdict, "invalid verdict response");
            Reply::Failed(Failure::new(
                FailureKind::InvalidResponse,
                format!("unrecognised verdict {:?}", response.verdict),
            ))
        };
        if !self.table.resolve(&guid, reply) {
            tracing::debug!(%guid, "no pending request for reply");
        }
    }

    fn on_error(&self, error: ErrorMessage) {
        let Some(guid) = error.request_id.clone().filter(|id| !id.is_empty()) else {
            tracing::warn!(error_type = %error.error_type, "server error: {}", error.message());
            return;
        };
        let kind = if error.is_client_error() {
            FailureKind::Client
        } else {
            FailureKind::Server
        };
        tracing::debug!(%guid, ?kind, "request failed on server: {}", error.message());
        if !self
            .table
            .resolve(&guid, Reply::Failed(Failure::new(kind, error.message())))
        {
            tracing::debug!(%guid, "no pending request for error");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
