//! WebSocket transport over `tokio-tungstenite`.

use crate::error::{Result, VaasError};
use crate::transport::{Connector, FrameSink, FrameSource, Inbound, OutboundFrame, ReadError, Transport};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials `url` (ws:// or wss://) once per connection attempt.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Transport> {
        tracing::debug!(url = %self.url, "opening websocket");
        let (stream, response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| match e {
                WsError::Http(resp) => VaasError::ConnectionFailed(format!(
                    "handshake failed with status {}",
                    resp.status()
                )),
                other => VaasError::ConnectionFailed(other.to_string()),
            })?;
        tracing::debug!(status = %response.status(), "websocket handshake complete");

        let (sink, source) = stream.split();
        Ok(Transport {
            sink: Box::new(WebSocketSink { sink }),
            source: Box::new(WebSocketSource { source }),
        })
    }
}

struct WebSocketSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<()> {
        let message = match frame {
            OutboundFrame::Text(text) => Message::Text(text),
            OutboundFrame::Ping(payload) => Message::Ping(payload),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| VaasError::ConnectionLost(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        // The peer may already be gone; closing is best effort.
        match self.sink.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {}
            Err(e) => return Err(VaasError::ConnectionLost(e.to_string())),
        }
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(VaasError::ConnectionLost(e.to_string())),
        }
    }
}

struct WebSocketSource {
    source: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WebSocketSource {
    async fn next(&mut self) -> Option<std::result::Result<Inbound, ReadError>> {
        loop {
            let message = match self.source.next().await? {
                Ok(message) => message,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => return None,
                Err(WsError::Utf8) => {
                    return Some(Err(ReadError::Transient("invalid UTF-8 in text frame".into())))
                }
                Err(e) => return Some(Err(ReadError::Fatal(e.to_string()))),
            };

            return Some(Ok(match message {
                Message::Text(text) => Inbound::Text(text),
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => Inbound::Text(text),
                    Err(_) => {
                        return Some(Err(ReadError::Transient(
                            "binary frame is not UTF-8".into(),
                        )))
                    }
                },
                Message::Pong(_) => Inbound::Pong,
                Message::Close(frame) => Inbound::Closed {
                    code: frame.as_ref().map(|f| u16::from(f.code)),
                    reason: frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
                },
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Frame(_) => continue,
            }));
        }
    }
}
