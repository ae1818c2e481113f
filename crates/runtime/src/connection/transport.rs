//! Transport seam between the connection manager and the wire.
//!
//! A [`Link`] is a pair of unbounded channels; the WebSocket implementation
//! bridges them to a socket from a single task that also runs the ping
//! keepalive.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};

use crate::keepalive::{Beat, Heartbeat, SocketLimits};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Send a normal close frame and stop writing.
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// The channel ended. `normal` is true only for a close frame with
    /// code 1000.
    Closed { normal: bool, reason: Option<String> },
}

pub struct Link {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Opens a new link to the backend. Called once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Link>;
}

#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    limits: SocketLimits,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            limits: SocketLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: SocketLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Link> {
        let handshake = connect_async_with_config(
            self.url.as_str(),
            Some(self.limits.websocket_config()),
            false,
        );
        let (stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, handshake)
            .await
            .with_context(|| format!("connect to {} timed out", self.url))?
            .with_context(|| format!("connect to {}", self.url))?;
        debug!(url = %self.url, "websocket established");

        let (out_tx, out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();
        tokio::spawn(run_link(stream, out_rx, in_tx, self.limits));

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

async fn run_link(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<Inbound>,
    limits: SocketLimits,
) {
    let (mut writer, mut reader) = stream.split();
    let mut heartbeat = Heartbeat::new(&limits);
    // Once our close frame is out, keep reading until the backend answers it.
    let mut closing = false;

    let closed = loop {
        tokio::select! {
            message = outbound.recv(), if !closing => match message {
                Some(Outbound::Text(text)) => {
                    if let Err(err) = writer.send(Message::Text(text)).await {
                        warn!(?err, "websocket write failed");
                        break Inbound::Closed {
                            normal: false,
                            reason: Some(err.to_string()),
                        };
                    }
                }
                Some(Outbound::Close) | None => {
                    closing = true;
                    let frame = CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client closing".into(),
                    };
                    if writer.send(Message::Close(Some(frame))).await.is_err() {
                        break Inbound::Closed {
                            normal: true,
                            reason: None,
                        };
                    }
                }
            },
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = inbound.send(Inbound::Text(text));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    let _ = inbound.send(Inbound::Text(text));
                }
                Some(Ok(Message::Pong(_))) => heartbeat.pong(),
                Some(Ok(Message::Close(frame))) => {
                    let normal = frame
                        .as_ref()
                        .map(|f| f.code == CloseCode::Normal)
                        .unwrap_or(false);
                    let reason = frame
                        .map(|f| f.reason.into_owned())
                        .filter(|r| !r.is_empty());
                    break Inbound::Closed { normal, reason };
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    break Inbound::Closed {
                        normal: false,
                        reason: Some(err.to_string()),
                    };
                }
                None => {
                    break Inbound::Closed {
                        normal: false,
                        reason: Some("connection reset".to_string()),
                    };
                }
            },
            beat = heartbeat.due() => match beat {
                Beat::Ping => {
                    if let Err(err) = writer.send(Message::Ping(Vec::new())).await {
                        break Inbound::Closed {
                            normal: false,
                            reason: Some(err.to_string()),
                        };
                    }
                }
                Beat::Expired => {
                    warn!(timeout = ?limits.ping_timeout, "backend missed keepalive ping");
                    break Inbound::Closed {
                        normal: false,
                        reason: Some("keepalive timed out".to_string()),
                    };
                }
            },
        }
    };

    let _ = inbound.send(closed);
    let _ = tokio::time::timeout(CLOSE_GRACE, writer.close()).await;
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use aide_llm::Engine;

    use super::*;
    use crate::server::BackendServer;

    fn fast_limits() -> SocketLimits {
        SocketLimits {
            ping_interval: Duration::from_millis(50),
            ping_timeout: Duration::from_millis(200),
            max_message_bytes: 64 * 1024,
        }
    }

    /// Completes the handshake and then never touches the socket again, so
    /// pings are never answered.
    async fn silent_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn unresponsive_backend_is_reported_as_abnormal_close() {
        let url = silent_server().await;
        let connector = WebSocketConnector::new(url).with_limits(fast_limits());
        let mut link = connector.connect().await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(5), link.inbound.recv())
            .await
            .unwrap();
        assert_eq!(
            closed,
            Some(Inbound::Closed {
                normal: false,
                reason: Some("keepalive timed out".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn healthy_backend_survives_many_ping_rounds() {
        let server = BackendServer::bind("127.0.0.1:0", Engine::default())
            .await
            .unwrap()
            .with_limits(fast_limits());
        let url = format!("ws://{}", server.local_addr().unwrap());
        tokio::spawn(server.run_until(std::future::pending()));

        let connector = WebSocketConnector::new(url).with_limits(fast_limits());
        let mut link = connector.connect().await.unwrap();
        assert!(matches!(link.inbound.recv().await, Some(Inbound::Text(_))));

        // Ten ping intervals with nothing but keepalive traffic.
        let quiet = tokio::time::timeout(Duration::from_millis(500), link.inbound.recv()).await;
        assert!(quiet.is_err(), "link closed: {quiet:?}");

        link.outbound
            .send(Outbound::Text(r#"{"action":"chat","content":"hi"}"#.to_string()))
            .unwrap();
        assert!(matches!(link.inbound.recv().await, Some(Inbound::Text(_))));
    }
}
