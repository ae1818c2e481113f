//! Per-client WebSocket handling. Requests on one connection are answered
//! in arrival order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use aide_config::Mode;
use aide_llm::{Action, Engine, EngineRequest};

use crate::keepalive::{Beat, Heartbeat, SocketLimits};
use crate::protocol::{RequestId, ResponseEnvelope, ServerGreeting, ServerReply};

const GREETING: &str = "Connected to AI backend";
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Request fields as the backend accepts them; anything missing takes a
/// default.
#[derive(Debug, Default, Deserialize)]
struct IncomingRequest {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    persona: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    options: Option<HashMap<String, Value>>,
    #[serde(default, rename = "requestId")]
    request_id: Option<RequestId>,
}

pub(super) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<Engine>,
    limits: SocketLimits,
) -> Result<()> {
    let socket = accept_async_with_config(stream, Some(limits.websocket_config())).await?;
    info!(%peer, "client connected");
    let (mut writer, mut reader) = socket.split();

    // Dropping the set aborts both helper tasks with the connection.
    let mut tasks = JoinSet::new();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    tasks.spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if let Err(err) = writer.send(message).await {
                warn!(%peer, ?err, "client write failed");
                break;
            }
        }
        let _ = writer.close().await;
    });

    let greeting = serde_json::to_string(&ServerGreeting::new(GREETING))?;
    let _ = out_tx.send(Message::Text(greeting));

    // Requests are answered one at a time in arrival order while the read
    // loop keeps handling pings and pongs.
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<String>();
    let replies = out_tx.clone();
    let worker = tasks.spawn(async move {
        while let Some(text) = request_rx.recv().await {
            let reply = handle_request(&engine, &text).await;
            match serde_json::to_string(&reply) {
                Ok(json) => {
                    if replies.send(Message::Text(json)).is_err() {
                        break;
                    }
                }
                Err(err) => error!(?err, "reply encoding failed"),
            }
        }
    });

    let mut heartbeat = Heartbeat::new(&limits);
    loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = request_tx.send(text);
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = request_tx.send(String::from_utf8_lossy(&bytes).into_owned());
                }
                Some(Ok(Message::Pong(_))) => heartbeat.pong(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(%peer, ?err, "client read failed");
                    break;
                }
            },
            beat = heartbeat.due() => match beat {
                Beat::Ping => {
                    let _ = out_tx.send(Message::Ping(Vec::new()));
                }
                Beat::Expired => {
                    warn!(%peer, timeout = ?limits.ping_timeout, "client missed keepalive ping");
                    break;
                }
            },
        }
    }

    worker.abort();
    drop(out_tx);
    let drain = async { while tasks.join_next().await.is_some() {} };
    let _ = tokio::time::timeout(CLOSE_GRACE, drain).await;

    info!(%peer, "client disconnected");
    Ok(())
}

/// Turn one raw request frame into the reply to send back.
pub(super) async fn handle_request(engine: &Engine, text: &str) -> ServerReply {
    let request: IncomingRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(err) => {
            error!(?err, "invalid request JSON");
            return ServerReply {
                envelope: ResponseEnvelope::failure("Invalid JSON format"),
                action: None,
                persona: None,
                mode: None,
                timestamp: Utc::now(),
            };
        }
    };

    let action_name = request.action.unwrap_or_default();
    let persona = request.persona.unwrap_or_else(|| "teacher".to_string());
    let mode = request
        .mode
        .as_deref()
        .and_then(|raw| raw.parse::<Mode>().ok())
        .unwrap_or_default();
    debug!(action = %action_name, %persona, %mode, "request received");

    let response = match action_name.parse::<Action>() {
        Ok(action) => {
            let engine_request = EngineRequest {
                action,
                content: request.content.unwrap_or_default(),
                persona: persona.clone(),
                mode,
                options: request.options.unwrap_or_default(),
            };
            engine.respond(&engine_request).await
        }
        Err(_) => format!(
            "Unknown action: {action_name}. Available actions: {}",
            Action::ALL.map(|a| a.as_str()).join(", ")
        ),
    };

    ServerReply {
        envelope: ResponseEnvelope::ok(response).with_request_id(request.request_id),
        action: Some(action_name),
        persona: Some(persona),
        mode: Some(mode.to_string()),
        timestamp: Utc::now(),
    }
}
