//! Writer Pump - the only task that writes to a connection.
//!
//! Drains the outbound queue in submission order and interleaves keepalive
//! pings. A failed or hung write ends the pump; reconnecting is up to the
//! supervisor.

use crate::engine::channel::{OutboundReceiver, Termination, KEEPALIVE_PAYLOAD};
use crate::transport::{FrameSink, OutboundFrame};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct WriterConfig {
    pub keepalive_interval: Duration,
    pub write_timeout: Duration,
}

pub struct WriterPump {
    sink: Box<dyn FrameSink>,
    queue: OutboundReceiver,
    config: WriterConfig,
    drain: CancellationToken,
}

impl WriterPump {
    pub fn new(
        sink: Box<dyn FrameSink>,
        queue: OutboundReceiver,
        config: WriterConfig,
        drain: CancellationToken,
    ) -> Self {
        Self {
            sink,
            queue,
            config,
            drain,
        }
    }

    pub async fn run(mut self) -> Termination {
        let period = self.config.keepalive_interval;
        let mut keepalive = interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.drain.cancelled() => return self.flush_and_close().await,

                frame = self.queue.recv() => match frame {
                    Some(text) => {
                        if let Err(reason) = self.write(OutboundFrame::Text(text)).await {
                            return Termination::Abrupt(reason);
                        }
                    }
                    // Every session handle is gone
                    None => return self.close().await,
                },

                _ = keepalive.tick() => {
                    tracing::trace!("sending keepalive");
                    if let Err(reason) = self.write(OutboundFrame::Ping(KEEPALIVE_PAYLOAD.to_vec())).await {
                        return Termination::Abrupt(reason);
                    }
                }
            }
        }
    }

    /// Write what is already queued, then send the close frame.
    async fn flush_and_close(&mut self) -> Termination {
        self.queue.close();
        let mut flushed = 0usize;
        while let Some(text) = self.queue.recv().await {
            if let Err(reason) = self.write(OutboundFrame::Text(text)).await {
                return Termination::Abrupt(reason);
            }
            flushed += 1;
        }
        tracing::debug!(flushed, "outbound queue flushed");
        self.close().await
    }

    async fn close(&mut self) -> Termination {
        match tokio::time::timeout(self.config.write_timeout, self.sink.close()).await {
            Ok(Ok(())) => Termination::Graceful,
            Ok(Err(e)) => Termination::Abrupt(e.to_string()),
            Err(_) => Termination::Abrupt("close frame not written in time".to_string()),
        }
    }

    async fn write(&mut self, frame: OutboundFrame) -> Result<(), String> {
        match tokio::time::timeout(self.config.write_timeout, self.sink.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::warn!("write failed: {}", e);
                Err(e.to_string())
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.config.write_timeout, "write timed out");
                Err(format!(
                    "write did not complete within {:?}",
                    self.config.write_timeout
                ))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
