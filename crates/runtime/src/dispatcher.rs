//! UI-facing request API: builds envelopes, sends them through the
//! connection manager, and mirrors each exchange to the transcript.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};

use aide_config::{ChatConfig, Mode};
use aide_llm::Action;

use crate::connection::ConnectionManager;
use crate::error::DispatchError;
use crate::events::EventBus;
use crate::protocol::RequestEnvelope;
use crate::transcript::{Role, Transcript, TranscriptEntry};

/// One AI request as a UI surface issues it. Persona and mode fall back to
/// the configured chat defaults.
#[derive(Debug, Clone)]
pub struct AiRequest {
    pub action: Action,
    pub content: String,
    pub persona: Option<String>,
    pub mode: Option<Mode>,
    pub options: HashMap<String, Value>,
    /// UI element the response populates; at most one request per target
    /// may be in flight.
    pub target: Option<String>,
}

impl AiRequest {
    pub fn new(action: Action, content: impl Into<String>) -> Self {
        Self {
            action,
            content: content.into(),
            persona: None,
            mode: None,
            options: HashMap::new(),
            target: None,
        }
    }

    pub fn persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

#[derive(Clone)]
pub struct RequestDispatcher {
    connection: ConnectionManager,
    bus: EventBus,
    transcript: Option<Transcript>,
    defaults: ChatConfig,
}

impl RequestDispatcher {
    pub fn new(
        connection: ConnectionManager,
        bus: EventBus,
        transcript: Option<Transcript>,
        defaults: ChatConfig,
    ) -> Self {
        Self {
            connection,
            bus,
            transcript,
            defaults,
        }
    }

    pub fn defaults(&self) -> &ChatConfig {
        &self.defaults
    }

    /// Persona and mode used when a request does not name one.
    pub fn set_defaults(&mut self, defaults: ChatConfig) {
        self.defaults = defaults;
    }

    /// Send a request and wait for its text. Fails fast with
    /// [`DispatchError::BackendUnavailable`] when the channel is not open.
    pub async fn dispatch(&self, request: AiRequest) -> Result<String, DispatchError> {
        let AiRequest {
            action,
            content,
            persona,
            mode,
            options,
            target,
        } = request;

        let persona = persona.unwrap_or_else(|| self.defaults.persona.clone());
        let mode = mode.unwrap_or(self.defaults.mode);
        self.record(TranscriptEntry::new(Role::User, Some(action), content.clone()));

        let envelope = RequestEnvelope::new(action, content, persona, mode, options);
        let outcome = match self.connection.send(envelope, target).await {
            Ok(pending) => {
                debug!(request_id = pending.request_id, %action, "awaiting response");
                match pending.wait().await {
                    Ok(response) if response.success => Ok(response.response.unwrap_or_default()),
                    Ok(response) => Err(DispatchError::Backend(
                        response
                            .error
                            .unwrap_or_else(|| "unknown backend error".to_string()),
                    )),
                    Err(err) => Err(DispatchError::from(err)),
                }
            }
            Err(err) => Err(DispatchError::from(err)),
        };

        match &outcome {
            Ok(text) => self.record(TranscriptEntry::new(Role::Assistant, Some(action), text.clone())),
            Err(err) => self.record(TranscriptEntry::new(Role::Error, Some(action), err.to_string())),
        }
        outcome
    }

    pub async fn explain(&self, code: impl Into<String>) -> Result<String, DispatchError> {
        self.dispatch(AiRequest::new(Action::Explain, code)).await
    }

    pub async fn translate(
        &self,
        code: impl Into<String>,
        target_language: impl Into<String>,
    ) -> Result<String, DispatchError> {
        let request = AiRequest::new(Action::Translate, code)
            .option("targetLanguage", target_language.into());
        self.dispatch(request).await
    }

    pub async fn optimize(&self, code: impl Into<String>) -> Result<String, DispatchError> {
        self.dispatch(AiRequest::new(Action::Optimize, code)).await
    }

    pub async fn chat(&self, message: impl Into<String>) -> Result<String, DispatchError> {
        self.dispatch(AiRequest::new(Action::Chat, message)).await
    }

    pub async fn fix_error(
        &self,
        code: impl Into<String>,
        error: impl Into<String>,
    ) -> Result<String, DispatchError> {
        let request = AiRequest::new(Action::FixError, code).option("error", error.into());
        self.dispatch(request).await
    }

    fn record(&self, entry: TranscriptEntry) {
        if let Some(transcript) = &self.transcript {
            if let Err(err) = transcript.append(&entry) {
                warn!(?err, "failed to append transcript entry");
            }
        }
        self.bus.transcript.publish(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use aide_config::ConnectionConfig;

    use crate::connection::{Connector, Inbound, Link, Outbound};

    /// Answers every request with the given closure's output.
    struct ScriptedBackend {
        answer: fn(&Value) -> Value,
    }

    #[async_trait]
    impl Connector for ScriptedBackend {
        async fn connect(&self) -> Result<Link> {
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let answer = self.answer;
            tokio::spawn(async move {
                while let Some(Outbound::Text(text)) = out_rx.recv().await {
                    let request: Value = serde_json::from_str(&text).unwrap();
                    let reply = answer(&request);
                    if in_tx.send(Inbound::Text(reply.to_string())).is_err() {
                        break;
                    }
                }
            });
            Ok(Link {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    fn echo(request: &Value) -> Value {
        serde_json::json!({
            "success": true,
            "response": format!(
                "{} {} as {} ({}) {}",
                request["action"].as_str().unwrap_or_default(),
                request["content"].as_str().unwrap_or_default(),
                request["persona"].as_str().unwrap_or_default(),
                request["mode"].as_str().unwrap_or_default(),
                request["options"],
            ),
        })
    }

    fn failing(_: &Value) -> Value {
        serde_json::json!({"success": false, "error": "model exploded"})
    }

    async fn dispatcher(
        answer: fn(&Value) -> Value,
        transcript: Option<Transcript>,
    ) -> (RequestDispatcher, EventBus) {
        let bus = EventBus::new();
        let connection = ConnectionManager::spawn(
            ConnectionConfig::default(),
            Arc::new(ScriptedBackend { answer }),
            bus.clone(),
        );
        connection.connect();
        connection
            .wait_until_open(std::time::Duration::from_secs(5))
            .await
            .unwrap();
        let dispatcher =
            RequestDispatcher::new(connection, bus.clone(), transcript, ChatConfig::default());
        (dispatcher, bus)
    }

    #[tokio::test]
    async fn explain_returns_backend_text() {
        let (dispatcher, _) = dispatcher(echo, None).await;
        let text = dispatcher.explain("x=1").await.unwrap();
        assert!(text.starts_with("explain x=1 as teacher (online)"));
    }

    #[tokio::test]
    async fn request_overrides_defaults_and_carries_options() {
        let (dispatcher, _) = dispatcher(echo, None).await;
        let text = dispatcher
            .dispatch(
                AiRequest::new(Action::Translate, "print(1)")
                    .persona("hacker")
                    .mode(Mode::Offline)
                    .option("targetLanguage", "rust"),
            )
            .await
            .unwrap();
        assert!(text.starts_with("translate print(1) as hacker (offline)"));
        assert!(text.contains("\"targetLanguage\":\"rust\""));
    }

    #[tokio::test]
    async fn backend_failure_is_reported_as_backend_error() {
        let (dispatcher, _) = dispatcher(failing, None).await;
        let err = dispatcher.chat("hi").await.unwrap_err();
        assert_eq!(err, DispatchError::Backend("model exploded".into()));
    }

    #[tokio::test]
    async fn closed_channel_fails_fast_as_unavailable() {
        let (dispatcher, _) = dispatcher(echo, None).await;
        dispatcher.connection.close().await;
        let err = dispatcher.optimize("x").await.unwrap_err();
        assert_eq!(err, DispatchError::BackendUnavailable);
    }

    #[tokio::test]
    async fn exchanges_are_mirrored_to_transcript_and_bus() {
        let dir = tempfile::TempDir::new().unwrap();
        let transcript = Transcript::new(dir.path());
        let (dispatcher, bus) = dispatcher(echo, Some(transcript.clone())).await;
        let mut mirrored = bus.transcript.subscribe();

        dispatcher.fix_error("x = y", "NameError").await.unwrap();

        assert_eq!(mirrored.recv().await.unwrap().role, Role::User);
        assert_eq!(mirrored.recv().await.unwrap().role, Role::Assistant);

        let saved = transcript.load_recent(10).unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].content, "x = y");
        assert_eq!(saved[1].action, Some(Action::FixError));
        assert!(saved[1].content.contains("NameError"));
    }
}
