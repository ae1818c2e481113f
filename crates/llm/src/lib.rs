//! Response generation for the AI backend: personas, prompt templates, and
//! routing between the online provider, the offline executable, and canned
//! fallback text.

mod persona;
mod providers;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use aide_config::{EngineConfig, Mode};

pub use persona::{Action, Persona, Prompt, build_prompt};
pub use providers::{LlamaCli, OpenAiCompatClient, Provider, clean_offline_output};

/// One generation request as the backend received it.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub action: Action,
    pub content: String,
    pub persona: String,
    pub mode: Mode,
    pub options: HashMap<String, Value>,
}

#[derive(Clone, Default)]
pub struct Engine {
    online: Option<Arc<dyn Provider>>,
    offline: Option<Arc<dyn Provider>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("online", &self.online.as_ref().map(|p| p.name().to_string()))
            .field("offline", &self.offline.as_ref().map(|p| p.name().to_string()))
            .finish()
    }
}

impl Engine {
    pub fn new(online: Option<Arc<dyn Provider>>, offline: Option<Arc<dyn Provider>>) -> Self {
        Self { online, offline }
    }

    /// Detect which modes are usable from keys, model files and executables.
    pub async fn discover(config: &EngineConfig) -> Self {
        let online = OpenAiCompatClient::from_config(config)
            .map(|client| Arc::new(client) as Arc<dyn Provider>);
        if online.is_none() {
            warn!("no API keys found for online mode");
        }
        let offline = LlamaCli::discover(config)
            .await
            .map(|cli| Arc::new(cli) as Arc<dyn Provider>);

        let engine = Self::new(online, offline);
        if engine.is_limited() {
            warn!("no AI provider available; running in limited mode");
        } else {
            info!(
                online = engine.online_available(),
                offline = engine.offline_available(),
                "engine initialised"
            );
        }
        engine
    }

    pub fn online_available(&self) -> bool {
        self.online.is_some()
    }

    pub fn offline_available(&self) -> bool {
        self.offline.is_some()
    }

    pub fn is_limited(&self) -> bool {
        self.online.is_none() && self.offline.is_none()
    }

    pub async fn respond(&self, request: &EngineRequest) -> String {
        let persona = Persona::resolve(&request.persona, request.action);
        let prompt = build_prompt(request.action, &request.content, persona, &request.options);
        self.generate(request.action, &prompt, request.mode).await
    }

    /// Use the requested mode when it is available, otherwise whichever mode
    /// is, otherwise the canned text for `action`.
    pub async fn generate(&self, action: Action, prompt: &Prompt, mode: Mode) -> String {
        match (mode, &self.online, &self.offline) {
            (Mode::Online, Some(_), _) => self.generate_online(prompt).await,
            (Mode::Offline, _, Some(offline)) => generate_offline(offline.as_ref(), prompt).await,
            (_, Some(_), _) => self.generate_online(prompt).await,
            (_, None, Some(offline)) => generate_offline(offline.as_ref(), prompt).await,
            (_, None, None) => fallback_text(action).to_string(),
        }
    }

    async fn generate_online(&self, prompt: &Prompt) -> String {
        let Some(online) = &self.online else {
            return fallback_text(Action::Chat).to_string();
        };

        match online.complete(prompt).await {
            Ok(text) => text,
            Err(err) => {
                error!(provider = online.name(), ?err, "online request failed");
                match &self.offline {
                    Some(offline) => {
                        info!("falling back to offline mode");
                        generate_offline(offline.as_ref(), prompt).await
                    }
                    None => format!("Sorry, I couldn't process your request. Error: {err}"),
                }
            }
        }
    }
}

async fn generate_offline(provider: &dyn Provider, prompt: &Prompt) -> String {
    match provider.complete(prompt).await {
        Ok(text) => text,
        Err(err) => {
            error!(provider = provider.name(), ?err, "offline generation failed");
            format!("Sorry, there was an error processing your request: {err}")
        }
    }
}

/// Canned guidance returned when no provider is configured.
pub fn fallback_text(action: Action) -> &'static str {
    match action {
        Action::Explain => {
            "AI services are not available right now, so I can't explain this code.\n\nTo enable AI features:\n1. Online mode: set OPENAI_API_KEY or GROQ_API_KEY\n2. Offline mode: put a GGUF/GGML model in the models/ directory and make llama.cpp available\n\nThe editor and file explorer keep working in the meantime."
        }
        Action::Translate => {
            "I can't translate code without AI services. General pointers:\n\n- Python to JavaScript: indentation becomes braces, def becomes function\n- JavaScript to Python: watch variable scoping and type coercion\n- Java to Python: lean on dynamic typing and shorter syntax\n\nSet up an AI provider for full translations."
        }
        Action::Optimize => {
            "Without AI services, some general optimisation tips:\n\n- Remove unused variables and imports\n- Pick the right data structure (list vs set vs dict)\n- Avoid nested loops where a lookup table works\n- Cache expensive results\n\nSet up an AI provider for code-specific suggestions."
        }
        Action::FixError => {
            "AI services are unavailable, so I can't diagnose this error. Read the last frame of the traceback, check the named variable or type, and set up an AI provider for a guided fix."
        }
        Action::Chat => {
            "I'm running in limited mode without AI services.\n\nTo enable full AI capabilities:\n1. Set OPENAI_API_KEY or GROQ_API_KEY for online mode\n2. Set up llama.cpp with a local model for offline mode"
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
