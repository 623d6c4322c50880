//! Connection supervisor.
//!
//! Owns one transport at a time and walks it through
//! Disconnected -> Connecting -> Authenticating -> Ready. When either pump
//! exits, the in-flight requests are failed and (if enabled) a new
//! connection is established after a backoff. `close` moves through
//! Draining to Closed.

use crate::auth::Authenticator;
use crate::engine::channel::{
    link_channel, outbound_channel, ConnectionState, Failure, FailureKind, Link, Pump, Session,
    Termination,
};
use crate::engine::correlation::CorrelationTable;
use crate::engine::protocol::{AuthRequest, ServerFrame};
use crate::engine::reader::ReaderPump;
use crate::engine::writer::{WriterConfig, WriterPump};
use crate::error::{Result, VaasError};
use crate::options::ConnectionOptions;
use crate::transport::{Connector, FrameSource, Inbound, OutboundFrame, ReadError, Transport};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A Ready connection: both pumps running.
pub struct Established {
    session_id: String,
    pumps: JoinSet<(Pump, Termination)>,
    drain: CancellationToken,
}

impl Established {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

pub struct Supervisor {
    connector: Arc<dyn Connector>,
    authenticator: Arc<dyn Authenticator>,
    table: Arc<CorrelationTable>,
    options: ConnectionOptions,
    link: watch::Sender<Link>,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        authenticator: Arc<dyn Authenticator>,
        table: Arc<CorrelationTable>,
        options: ConnectionOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let (link, _) = link_channel();
        Self {
            connector,
            authenticator,
            table,
            options,
            link,
            shutdown,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Link> {
        self.link.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.link.borrow().state
    }

    fn publish(&self, state: ConnectionState, session: Option<Arc<Session>>) {
        self.link.send_modify(|link| {
            link.state = state;
            link.session = session;
            if state == ConnectionState::Ready {
                link.connected = true;
            }
        });
        tracing::debug!(%state, "connection state changed");
    }

    fn publish_closed(&self, terminal: Option<Failure>) {
        self.link.send_modify(|link| {
            link.state = ConnectionState::Closed;
            link.session = None;
            link.terminal = terminal;
        });
        tracing::debug!("connection state changed to closed");
    }

    // =========================================================================
    // Establishing a connection
    // =========================================================================

    /// Open a transport, authenticate and start both pumps.
    pub async fn establish(&self) -> Result<Established> {
        match self.try_establish().await {
            Ok(established) => Ok(established),
            Err(e) => {
                self.publish(ConnectionState::Disconnected, None);
                Err(e)
            }
        }
    }

    async fn try_establish(&self) -> Result<Established> {
        self.publish(ConnectionState::Connecting, None);
        let Transport { mut sink, mut source } = self.connector.connect().await?;

        self.publish(ConnectionState::Authenticating, None);
        let token = self.authenticator.get_token().await?;
        let frame = AuthRequest::new(token).encode()?;
        match tokio::time::timeout(self.options.write_timeout, sink.send(OutboundFrame::Text(frame)))
            .await
        {
            Ok(result) => result.map_err(|e| VaasError::ConnectionFailed(e.to_string()))?,
            Err(_) => {
                return Err(VaasError::ConnectionFailed(
                    "auth frame not written in time".to_string(),
                ))
            }
        }
        let session_id = self.await_auth(source.as_mut()).await?;

        let (outbound, queue) = outbound_channel(self.options.outbound_queue);
        let drain = CancellationToken::new();
        let mut pumps = JoinSet::new();

        let writer = WriterPump::new(
            sink,
            queue,
            WriterConfig {
                keepalive_interval: self.options.keepalive_interval,
                write_timeout: self.options.write_timeout,
            },
            drain.clone(),
        );
        pumps.spawn(async move { (Pump::Writer, writer.run().await) });

        let reader = ReaderPump::new(source, self.table.clone(), self.options.read_timeout);
        pumps.spawn(async move { (Pump::Reader, reader.run().await) });

        let session = Arc::new(Session::new(session_id.clone(), outbound));
        self.publish(ConnectionState::Ready, Some(session));
        tracing::info!(session = %session_id, "connection ready");

        Ok(Established {
            session_id,
            pumps,
            drain,
        })
    }

    /// Wait for the auth result. Frames that arrive before it are dropped.
    async fn await_auth(&self, source: &mut dyn FrameSource) -> Result<String> {
        let deadline = Instant::now() + self.options.read_timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, source.next())
                .await
                .map_err(|_| {
                    VaasError::ConnectionFailed("no auth response within read timeout".into())
                })?;

            let text = match next {
                None => {
                    return Err(VaasError::ConnectionFailed(
                        "connection dropped during authentication".into(),
                    ))
                }
                Some(Err(ReadError::Fatal(reason))) => {
                    return Err(VaasError::ConnectionFailed(reason))
                }
                Some(Err(ReadError::Transient(reason))) => {
                    tracing::warn!("skipping frame during authentication: {}", reason);
                    continue;
                }
                Some(Ok(Inbound::Pong)) => continue,
                Some(Ok(Inbound::Closed { code, reason })) => {
                    return Err(VaasError::ConnectionFailed(format!(
                        "server closed the connection during authentication ({:?}: {})",
                        code, reason
                    )))
                }
                Some(Ok(Inbound::Text(text))) => text,
            };

            match ServerFrame::decode(&text) {
                Ok(ServerFrame::Auth(response)) => {
                    if response.success && !response.session_id.is_empty() {
                        return Ok(response.session_id);
                    }
                    let reason = if response.text.is_empty() {
                        "server rejected the token".to_string()
                    } else {
                        response.text
                    };
                    return Err(VaasError::AuthenticationFailed(reason));
                }
                Ok(ServerFrame::Error(error)) => {
                    return Err(VaasError::AuthenticationFailed(error.message()))
                }
                Ok(_) => tracing::warn!("dropping frame received before authentication"),
                Err(e) => tracing::warn!("dropping frame during authentication: {}", e),
            }
        }
    }

    // =========================================================================
    // Supervision loop
    // =========================================================================

    /// Supervise `current` and its successors until shutdown or a terminal
    /// failure.
    pub async fn run(self: Arc<Self>, mut current: Established) {
        loop {
            let exit = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                exit = current.pumps.join_next() => Some(exit),
            };
            let Some(exit) = exit else {
                self.drain(current).await;
                return;
            };

            match exit {
                Some(Ok((pump, termination))) => {
                    tracing::warn!(session = %current.session_id, ?pump, "connection {}", termination)
                }
                Some(Err(e)) => tracing::error!(session = %current.session_id, "pump task failed: {}", e),
                None => tracing::warn!(session = %current.session_id, "pumps already stopped"),
            }

            let reason = format!("connection to session {} lost", current.session_id);
            self.teardown(current, Failure::connection_lost(reason.clone()))
                .await;

            if !self.options.reconnect {
                tracing::error!("connection lost and reconnect is disabled");
                self.publish_closed(Some(Failure::connection_lost(reason)));
                return;
            }

            match self.reconnect().await {
                Some(established) => current = established,
                None => return,
            }
        }
    }

    /// Stop both pumps, then fail whatever is still pending.
    async fn teardown(&self, mut current: Established, failure: Failure) {
        // Unpublish first so no new request picks up the dying session
        self.publish(ConnectionState::Disconnected, None);
        current.pumps.abort_all();
        while current.pumps.join_next().await.is_some() {}

        let failed = self.table.fail_all(failure);
        if failed > 0 {
            tracing::warn!(failed, session = %current.session_id, "failed in-flight requests");
        }
    }

    async fn reconnect(&self) -> Option<Established> {
        let mut attempt = 0u32;
        loop {
            let delay = self.options.backoff(attempt);
            tracing::warn!(attempt = attempt + 1, ?delay, "reconnecting");

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.publish_closed(None);
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.publish_closed(None);
                    return None;
                }
                result = self.establish() => result,
            };

            match result {
                Ok(established) => {
                    tracing::info!(session = %established.session_id, "reconnected");
                    return Some(established);
                }
                Err(VaasError::AuthenticationFailed(reason)) => {
                    tracing::error!("authentication failed during reconnect: {}", reason);
                    self.publish_closed(Some(Failure::new(FailureKind::Authentication, reason)));
                    return None;
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, "reconnect failed: {}", e);
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Refuse new work, let in-flight requests finish, flush and close.
    async fn drain(&self, mut current: Established) {
        self.publish(ConnectionState::Draining, None);
        let pending = self.table.len();
        tracing::info!(pending, session = %current.session_id, "draining connection");

        let pumps_alive = tokio::select! {
            _ = tokio::time::timeout(self.options.drain_timeout, self.table.wait_idle()) => true,
            exit = current.pumps.join_next() => {
                if let Some(Ok((pump, termination))) = exit {
                    tracing::debug!(?pump, "pump stopped while draining: {}", termination);
                }
                false
            }
        };

        if pumps_alive {
            current.drain.cancel();
            let bound = self.options.write_timeout + self.options.read_timeout;
            let stopped = tokio::time::timeout(bound, async {
                while let Some(exit) = current.pumps.join_next().await {
                    if let Ok((pump, termination)) = exit {
                        tracing::debug!(?pump, "pump stopped: {}", termination);
                    }
                }
            })
            .await;
            if stopped.is_err() {
                tracing::warn!("pumps did not stop in time; aborting");
            }
        }
        current.pumps.abort_all();
        while current.pumps.join_next().await.is_some() {}

        let failed = self.table.fail_all(Failure::shutdown());
        if failed > 0 {
            tracing::warn!(failed, "requests still pending at close");
        }
        self.publish_closed(None);
        tracing::info!(session = %current.session_id, "connection closed");
    }

    /// Close an engine that never got connected.
    pub fn close_idle(&self) {
        self.table.fail_all(Failure::shutdown());
        self.publish_closed(None);
    }
}

// =============================================================================
// Tests
// =============================================================================
