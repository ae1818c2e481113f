//! JSON messages exchanged with the AI backend over the WebSocket channel.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use aide_config::Mode;
use aide_llm::Action;

/// Monotonically increasing per-process request identifier.
pub type RequestId = u64;

/// Value of the `type` field on the greeting the backend sends on connect.
pub const GREETING_TYPE: &str = "connection";

/// One outgoing AI request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub action: Action,
    pub content: String,
    pub persona: String,
    pub mode: Mode,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub options: HashMap<String, Value>,
    /// Assigned by the connection manager when the request goes on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl RequestEnvelope {
    pub fn new(
        action: Action,
        content: impl Into<String>,
        persona: impl Into<String>,
        mode: Mode,
        options: HashMap<String, Value>,
    ) -> Self {
        Self {
            action,
            content: content.into(),
            persona: persona.into(),
            mode,
            timestamp: Utc::now(),
            options,
            request_id: None,
        }
    }
}

/// The part of a backend reply the client acts on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl ResponseEnvelope {
    pub fn ok(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: Some(response.into()),
            error: None,
            request_id: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            response: None,
            error: Some(error.into()),
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<RequestId>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// Full reply as written by the backend server, echoing request metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerReply {
    #[serde(flatten)]
    pub envelope: ResponseEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerGreeting {
    #[serde(rename = "type")]
    pub kind: String,
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl ServerGreeting {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: GREETING_TYPE.to_string(),
            success: true,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A frame received by the client, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// Connection greeting; never correlated with a request.
    Greeting { message: String },
    Response(ResponseEnvelope),
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        if value.get("type").and_then(Value::as_str) == Some(GREETING_TYPE) {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Ok(InboundMessage::Greeting { message });
        }
        serde_json::from_value(value).map(InboundMessage::Response)
    }
}
