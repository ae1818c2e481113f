use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info};

use aide_config::EngineConfig;

use crate::Prompt;

/// A text-generation backend the engine can route prompts to.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &Prompt) -> Result<String>;
}

// ── Online: OpenAI-compatible chat completions ───────────────────────────────

#[derive(Debug, Clone)]
pub struct OpenAiCompatClient {
    label: String,
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiCompatClient {
    pub fn new(
        label: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        config: &EngineConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.online_timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            label: label.into(),
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    /// OpenAI when its key is set, otherwise Groq, otherwise nothing.
    pub fn from_config(config: &EngineConfig) -> Option<Self> {
        if !config.openai_api_key.trim().is_empty() {
            return Some(Self::new(
                "openai",
                &config.openai_base_url,
                &config.openai_api_key,
                &config.openai_model,
                config,
            ));
        }
        if !config.groq_api_key.trim().is_empty() {
            return Some(Self::new(
                "groq",
                &config.groq_base_url,
                &config.groq_api_key,
                &config.groq_model,
                config,
            ));
        }
        None
    }
}

#[async_trait]
impl Provider for OpenAiCompatClient {
    fn name(&self) -> &str {
        &self.label
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user}
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        let response = self
            .client
            .post(endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("{} error ({status}): {body}", self.label);
        }

        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(|content| content.trim().to_string())
            .ok_or_else(|| anyhow!("{} response missing text: {body}", self.label))
    }
}

// ── Offline: external llama.cpp executable ───────────────────────────────────

#[derive(Debug, Clone)]
pub struct LlamaCli {
    executable: PathBuf,
    model_path: PathBuf,
    max_tokens: u32,
    timeout: Duration,
}

impl LlamaCli {
    pub fn new(executable: PathBuf, model_path: PathBuf, config: &EngineConfig) -> Self {
        Self {
            executable,
            model_path,
            max_tokens: config.offline_max_tokens,
            timeout: Duration::from_secs(config.offline_timeout_secs),
        }
    }

    /// Offline mode needs both a model file and a runnable executable.
    pub async fn discover(config: &EngineConfig) -> Option<Self> {
        let model_path = find_model_file(Path::new(&config.models_dir));
        let mut executable = None;
        for candidate in &config.llama_candidates {
            if Path::new(candidate).is_file() || probe_executable(candidate).await {
                executable = Some(PathBuf::from(candidate));
                break;
            }
        }

        match (executable, model_path) {
            (Some(executable), Some(model_path)) => {
                info!(
                    executable = %executable.display(),
                    model = %model_path.display(),
                    "offline mode configured"
                );
                Some(Self::new(executable, model_path, config))
            }
            (executable, model_path) => {
                info!(?executable, ?model_path, "offline mode not available");
                None
            }
        }
    }
}

#[async_trait]
impl Provider for LlamaCli {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    async fn complete(&self, prompt: &Prompt) -> Result<String> {
        let rendered = prompt.render();
        let run = Command::new(&self.executable)
            .arg("-m")
            .arg(&self.model_path)
            .arg("-p")
            .arg(&rendered)
            .arg("-n")
            .arg(self.max_tokens.to_string())
            .args(["-t", "4", "--temp", "0.7", "--top-p", "0.9", "--repeat-penalty", "1.1"])
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(output) => output?,
            Err(_) => bail!(
                "offline generation timed out after {}s",
                self.timeout.as_secs()
            ),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            bail!("llama.cpp exited with {}: {stderr}", output.status);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(clean_offline_output(&stdout, &rendered))
    }
}

/// Strip the echoed prompt llama.cpp prints ahead of the completion.
pub fn clean_offline_output(stdout: &str, prompt: &str) -> String {
    let text = stdout.trim_start();
    let text = text.strip_prefix(prompt.trim_start()).unwrap_or(text);
    let cleaned = text.trim();
    if cleaned.is_empty() {
        "I apologize, but I couldn't generate a proper response.".to_string()
    } else {
        cleaned.to_string()
    }
}

fn find_model_file(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut models = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| matches!(ext, "gguf" | "ggml" | "bin"))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    models.sort();
    models.into_iter().next()
}

async fn probe_executable(candidate: &str) -> bool {
    let probe = Command::new(candidate)
        .arg("--version")
        .kill_on_drop(true)
        .output();
    match tokio::time::timeout(Duration::from_secs(5), probe).await {
        Ok(Ok(output)) => output.status.success(),
        Ok(Err(err)) => {
            debug!(candidate, ?err, "executable probe failed");
            false
        }
        Err(_) => false,
    }
}
