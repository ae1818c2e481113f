use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use url::Url;

// ── Backend launch ────────────────────────────────────────────────────────────

/// How the supervisor starts the AI backend.
///
/// | Mode       | Command line                                  |
/// |------------|-----------------------------------------------|
/// | `embedded` | `<current exe> serve` (the bundled backend)   |
/// | `script`   | `<runtime> <script_path>` after a runtime probe |
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    #[default]
    Embedded,
    Script,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Start the backend process when the application starts.  Disable when
    /// the backend is managed elsewhere and only the socket is needed.
    pub autostart: bool,
    pub launch: LaunchMode,
    /// Interpreters probed in order with `--version` when `launch = "script"`.
    pub runtime_candidates: Vec<String>,
    pub script_path: String,
    /// Exact stdout line the backend prints once it accepts connections.
    pub ready_marker: String,
    pub ready_timeout_ms: u64,
    /// Time allowed between SIGTERM and a forced kill.
    pub stop_grace_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            launch: LaunchMode::Embedded,
            runtime_candidates: vec![
                "python3".to_string(),
                "python".to_string(),
                "py".to_string(),
            ],
            script_path: "backend/api.py".to_string(),
            ready_marker: "AIDE_BACKEND_READY".to_string(),
            ready_timeout_ms: 15_000,
            stop_grace_ms: 3_000,
            probe_timeout_ms: 5_000,
        }
    }
}

// ── Connection ───────────────────────────────────────────────────────────────

/// How inbound responses are matched to pending requests.
///
/// `fifo` matches strictly by arrival order against the oldest pending
/// request.  `request_id` matches on the echoed `requestId` field and falls
/// back to arrival order when a response carries none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Correlation {
    #[default]
    Fifo,
    RequestId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub max_reconnect_attempts: u32,
    /// Retry `n` waits `reconnect_base_delay_ms * n`.
    pub reconnect_base_delay_ms: u64,
    pub request_timeout_ms: u64,
    pub correlation: Correlation,
    /// Both ends ping this often; `0` disables keepalive.
    pub ping_interval_ms: u64,
    /// A ping with no pong after this long closes the socket.
    pub ping_timeout_ms: u64,
    /// Larger inbound WebSocket messages close the connection.
    pub max_message_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8765,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 2_000,
            request_timeout_ms: 30_000,
            correlation: Correlation::Fifo,
            ping_interval_ms: 20_000,
            ping_timeout_ms: 10_000,
            max_message_bytes: 1024 * 1024,
        }
    }
}

impl ConnectionConfig {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ── Chat defaults ────────────────────────────────────────────────────────────

/// Where the backend should generate a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Online,
    Offline,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Online => "online",
            Mode::Offline => "offline",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "online" => Ok(Mode::Online),
            "offline" => Ok(Mode::Offline),
            other => bail!("unknown mode '{other}', expected online or offline"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub persona: String,
    pub mode: Mode,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            persona: "teacher".to_string(),
            mode: Mode::Online,
        }
    }
}

// ── Engine (backend side) ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Can also be set via `OPENAI_API_KEY` (env takes precedence).
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub openai_model: String,
    /// Can also be set via `GROQ_API_KEY` (env takes precedence).
    pub groq_api_key: String,
    pub groq_base_url: String,
    pub groq_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub online_timeout_secs: u64,
    /// Directory scanned for `.gguf` / `.ggml` / `.bin` model files.
    pub models_dir: String,
    /// llama.cpp style executables tried in order for offline mode.
    pub llama_candidates: Vec<String>,
    pub offline_max_tokens: u32,
    pub offline_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            groq_api_key: String::new(),
            groq_base_url: "https://api.groq.com/openai/v1".to_string(),
            groq_model: "llama-3.1-8b-instant".to_string(),
            max_tokens: 1_000,
            temperature: 0.7,
            online_timeout_secs: 30,
            models_dir: "models".to_string(),
            llama_candidates: vec![
                "llama.cpp/llama-cli".to_string(),
                "llama-cli".to_string(),
                "llama".to_string(),
            ],
            offline_max_tokens: 500,
            offline_timeout_secs: 60,
        }
    }
}

// ── Transcript + telemetry ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    pub enabled: bool,
    /// Daily `YYYY-MM-DD.jsonl` files are written here.
    pub dir: String,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: ".aide/transcript".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Used when `RUST_LOG` is not set.
    pub log_level: String,
    pub log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: ".aide/logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub connection: ConnectionConfig,
    pub chat: ChatConfig,
    pub engine: EngineConfig,
    pub transcript: TranscriptConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        // `ws://host:port` override for pointing at an externally managed backend.
        if let Ok(value) = env::var("AIDE_BACKEND_URL") {
            if !value.trim().is_empty() {
                config.connection.apply_url(value.trim())?;
            }
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            if !key.is_empty() {
                config.engine.openai_api_key = key;
            }
        }

        if let Ok(key) = env::var("GROQ_API_KEY") {
            if !key.is_empty() {
                config.engine.groq_api_key = key;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

impl ConnectionConfig {
    fn apply_url(&mut self, raw: &str) -> Result<()> {
        let parsed = Url::parse(raw)?;
        // The backend serves plain WebSocket only; `url()` always builds ws://.
        if parsed.scheme() != "ws" {
            bail!("AIDE_BACKEND_URL must use ws://, got {raw}");
        }
        let Some(host) = parsed.host_str() else {
            bail!("AIDE_BACKEND_URL has no host: {raw}");
        };
        self.host = host.to_string();
        if let Some(port) = parsed.port() {
            self.port = port;
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // ── Connection-resilience defaults ────────────────────────────────────
    // The reconnect schedule and request timeout are user-visible behaviour.

    #[test]
    fn connection_defaults_match_reconnect_schedule() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.connection.max_reconnect_attempts, 5);
        assert_eq!(cfg.connection.reconnect_base_delay_ms, 2_000);
        assert_eq!(cfg.connection.request_timeout_ms, 30_000);
        assert_eq!(cfg.connection.correlation, Correlation::Fifo);
        assert_eq!(cfg.connection.url(), "ws://localhost:8765");
    }

    #[test]
    fn backend_defaults() {
        let cfg = AppConfig::default();
        assert!(cfg.backend.autostart);
        assert_eq!(cfg.backend.launch, LaunchMode::Embedded);
        assert_eq!(cfg.backend.stop_grace_ms, 3_000);
        assert_eq!(cfg.backend.runtime_candidates[0], "python3");
        assert_eq!(cfg.backend.ready_marker, "AIDE_BACKEND_READY");
    }

    #[test]
    fn chat_and_telemetry_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.chat.persona, "teacher");
        assert_eq!(cfg.chat.mode, Mode::Online);
        assert_eq!(cfg.telemetry.log_level, "info");
        assert!(cfg.transcript.enabled);
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.connection.port, 8765);
        assert_eq!(cfg.chat.persona, "teacher");
    }

    #[test]
    fn load_from_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.toml");
        fs::write(
            &path,
            r#"
[backend]
launch = "script"
script_path = "src/backend/api.py"
runtime_candidates = ["python3.12"]

[connection]
host = "127.0.0.1"
port = 9001
correlation = "request_id"

[chat]
persona = "hacker"
mode = "offline"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.backend.launch, LaunchMode::Script);
        assert_eq!(cfg.backend.script_path, "src/backend/api.py");
        assert_eq!(cfg.backend.runtime_candidates, vec!["python3.12"]);
        assert_eq!(cfg.connection.url(), "ws://127.0.0.1:9001");
        assert_eq!(cfg.connection.correlation, Correlation::RequestId);
        assert_eq!(cfg.chat.persona, "hacker");
        assert_eq!(cfg.chat.mode, Mode::Offline);
        // Unspecified fields keep their defaults
        assert_eq!(cfg.connection.max_reconnect_attempts, 5);
        assert_eq!(cfg.backend.stop_grace_ms, 3_000);
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    // ── save_to + roundtrip ────────────────────────────────────────────────

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.connection.port = 9100;
        cfg.connection.correlation = Correlation::RequestId;
        cfg.chat.persona = "reviewer".to_string();
        cfg.engine.llama_candidates = vec!["/opt/llama".to_string()];

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.connection.port, 9100);
        assert_eq!(loaded.connection.correlation, Correlation::RequestId);
        assert_eq!(loaded.chat.persona, "reviewer");
        assert_eq!(loaded.engine.llama_candidates, vec!["/opt/llama".to_string()]);
    }

    // ── Mode parsing ───────────────────────────────────────────────────────

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Online".parse::<Mode>().unwrap(), Mode::Online);
        assert_eq!(" offline ".parse::<Mode>().unwrap(), Mode::Offline);
        assert!("cloud".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Mode::Offline).unwrap(), "\"offline\"");
    }

    // ── Backend URL override ───────────────────────────────────────────────

    #[test]
    fn apply_url_sets_host_and_port() {
        let mut conn = ConnectionConfig::default();
        conn.apply_url("ws://10.0.0.5:9999").unwrap();
        assert_eq!(conn.host, "10.0.0.5");
        assert_eq!(conn.port, 9999);
    }

    #[test]
    fn apply_url_rejects_http_scheme() {
        let mut conn = ConnectionConfig::default();
        assert!(conn.apply_url("http://localhost:8765").is_err());
        assert_eq!(conn.host, "localhost");
    }

    #[test]
    fn apply_url_rejects_tls_scheme() {
        let mut conn = ConnectionConfig::default();
        assert!(conn.apply_url("wss://remote.example:443").is_err());
        assert_eq!(conn.host, "localhost");
        assert_eq!(conn.url(), "ws://localhost:8765");
    }

    #[test]
    fn keepalive_defaults() {
        let conn = ConnectionConfig::default();
        assert_eq!(conn.ping_interval_ms, 20_000);
        assert_eq!(conn.ping_timeout_ms, 10_000);
        assert_eq!(conn.max_message_bytes, 1024 * 1024);
    }
}
