mod backend;
mod interactive;

use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use aide_config::{AppConfig, ConnectionConfig, Mode};
use aide_llm::{Action, Engine};
use aide_runtime::{
    AiRequest, AppContext, BackendSupervisor, Connector, EventBus, SocketLimits, Transcript,
    WebSocketConnector,
};

const CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Parser)]
#[command(name = "aide", version, about = "AI coding assistant for the editor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the AI backend server in the foreground.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Send one request and print the response.
    Ask {
        /// explain, translate, optimize, chat or fix_error
        action: Action,
        /// Content to send; read from --file or stdin when omitted.
        text: Option<String>,
        #[arg(long, conflicts_with = "text")]
        file: Option<PathBuf>,
        #[arg(long)]
        persona: Option<String>,
        #[arg(long)]
        mode: Option<Mode>,
        /// Target language for `translate`.
        #[arg(long = "to", value_name = "LANGUAGE")]
        target_language: Option<String>,
        /// Error message for `fix_error`.
        #[arg(long)]
        error: Option<String>,
        /// Connect to an already running backend instead of starting one.
        #[arg(long)]
        no_spawn: bool,
    },
    /// Interactive line-based session (the default).
    Chat {
        #[arg(long)]
        no_spawn: bool,
    },
    /// Check configuration, backend launch, providers and connectivity.
    Doctor,
    /// Write the default configuration to `config/default.toml`.
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },
    /// Manage the conversation transcript (persisted daily JSONL).
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },
}

#[derive(Debug, Subcommand)]
enum HistoryCommands {
    /// Delete today's transcript file.
    Clear,
    /// Export today's transcript to a file.
    Export {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Show the path to today's transcript file.
    Path,
    /// Print the most recent entries.
    Show {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::load_from(CONFIG_PATH)?;
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Chat { no_spawn: false });

    match command {
        Commands::Serve { host, port } => {
            // stdout only: the supervisor treats any stderr output as an error.
            tracing_subscriber::fmt()
                .with_env_filter(env_filter(&config))
                .with_ansi(false)
                .init();
            backend::run_serve(config, host, port).await
        }
        Commands::Chat { no_spawn } => {
            let _guard = init_file_logging(&config)?;
            let mut config = config;
            if no_spawn {
                config.backend.autostart = false;
            }
            interactive::run_chat_session(config).await
        }
        Commands::Ask {
            action,
            text,
            file,
            persona,
            mode,
            target_language,
            error,
            no_spawn,
        } => {
            init_stderr_logging(&config);
            let content = read_content(text, file.as_deref())?;
            let mut request = AiRequest::new(action, content);
            if let Some(persona) = persona {
                request = request.persona(persona);
            }
            if let Some(mode) = mode {
                request = request.mode(mode);
            }
            if let Some(language) = target_language {
                request = request.option("targetLanguage", language);
            }
            if let Some(error) = error {
                request = request.option("error", error);
            }
            let mut config = config;
            if no_spawn {
                config.backend.autostart = false;
            }
            run_ask(config, request).await
        }
        Commands::Doctor => {
            init_stderr_logging(&config);
            run_doctor(&config).await
        }
        Commands::Init { force } => {
            init_stderr_logging(&config);
            run_init(Path::new(CONFIG_PATH), force)?;
            println!("wrote {CONFIG_PATH}");
            Ok(())
        }
        Commands::History { command } => {
            init_stderr_logging(&config);
            let transcript = Transcript::new(&config.transcript.dir);
            match command {
                HistoryCommands::Clear => {
                    transcript.clear()?;
                    println!("transcript cleared");
                }
                HistoryCommands::Export { path } => {
                    transcript.export(&path)?;
                    println!("transcript exported to {}", path.display());
                }
                HistoryCommands::Path => {
                    println!("{}", transcript.path().display());
                }
                HistoryCommands::Show { limit } => {
                    let entries = transcript.load_recent(limit)?;
                    if entries.is_empty() {
                        println!("(no transcript entries today)");
                    }
                    for entry in entries {
                        println!("{}", serde_json::to_string(&entry)?);
                    }
                }
            }
            Ok(())
        }
    }
}

fn env_filter(config: &AppConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level))
}

fn init_stderr_logging(config: &AppConfig) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_writer(io::stderr)
        .init();
}

/// The interactive session owns the terminal, so logs go to a daily file.
fn init_file_logging(config: &AppConfig) -> Result<WorkerGuard> {
    fs::create_dir_all(&config.telemetry.log_dir)?;
    let appender = tracing_appender::rolling::daily(&config.telemetry.log_dir, "aide.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Ok(guard)
}

fn read_content(text: Option<String>, file: Option<&Path>) -> Result<String> {
    let content = match (text, file) {
        (Some(text), _) => text,
        (None, Some(path)) => fs::read_to_string(path)?,
        (None, None) => {
            if io::stdin().is_terminal() {
                bail!("no content given; pass TEXT, --file, or pipe it on stdin");
            }
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    if content.trim().is_empty() {
        bail!("content is empty");
    }
    Ok(content)
}

/// Defaults only: env-supplied API keys never end up on disk.
fn run_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; pass --force to overwrite", path.display());
    }
    AppConfig::default().save_to(path)
}

/// Long enough to ride out every scheduled reconnect.
pub(crate) fn reconnect_window(config: &ConnectionConfig) -> Duration {
    let attempts = u64::from(config.max_reconnect_attempts);
    let backoff = config.reconnect_base_delay_ms * attempts * (attempts + 1) / 2;
    Duration::from_millis(backoff) + Duration::from_secs(5)
}

async fn run_ask(config: AppConfig, request: AiRequest) -> Result<()> {
    let window = reconnect_window(&config.connection);
    let context = AppContext::new(config);
    if let Err(err) = context.start().await {
        eprintln!("warning: {err}");
    }

    if let Err(err) = context.connection.wait_until_open(window).await {
        context.shutdown().await;
        bail!("AI backend unavailable: {err}");
    }

    let outcome = context.dispatcher.dispatch(request).await;
    context.shutdown().await;
    match outcome {
        Ok(text) => {
            println!("{text}");
            Ok(())
        }
        Err(err) => bail!(err),
    }
}

async fn run_doctor(config: &AppConfig) -> Result<()> {
    println!("aide doctor");
    println!(
        "config: {} ({})",
        CONFIG_PATH,
        if Path::new(CONFIG_PATH).exists() { "found" } else { "defaults" }
    );
    println!("backend url: {}", config.connection.url());
    println!("correlation: {:?}", config.connection.correlation);

    let supervisor = BackendSupervisor::new(config.backend.clone(), EventBus::new());
    match supervisor.resolve_launch().await {
        Ok(plan) => println!(
            "backend launch: {} (cwd {})",
            plan.display(),
            plan.working_dir.display()
        ),
        Err(err) => println!("backend launch: FAILED - {err}"),
    }

    let engine = Engine::discover(&config.engine).await;
    println!(
        "online provider: {}",
        if engine.online_available() { "available" } else { "not configured" }
    );
    println!(
        "offline model: {}",
        if engine.offline_available() { "available" } else { "not found" }
    );
    if engine.is_limited() {
        println!("note: backend will answer with canned guidance until a provider is set up");
    }

    let connector = WebSocketConnector::new(config.connection.url())
        .with_limits(SocketLimits::from(&config.connection));
    match connector.connect().await {
        Ok(link) => {
            let _ = link.outbound.send(aide_runtime::Outbound::Close);
            println!("backend reachable: yes");
        }
        Err(err) => println!("backend reachable: no ({err:#})"),
    }

    println!(
        "transcript: {}",
        if config.transcript.enabled {
            Transcript::new(&config.transcript.dir).path().display().to_string()
        } else {
            "disabled".to_string()
        }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_window_covers_the_backoff_schedule() {
        let config = ConnectionConfig::default();
        // 2 + 4 + 6 + 8 + 10 seconds of backoff plus slack.
        assert_eq!(reconnect_window(&config), Duration::from_secs(35));
    }

    #[test]
    fn ask_parses_action_and_options() {
        let cli = Cli::try_parse_from([
            "aide", "ask", "translate", "print(1)", "--to", "rust", "--mode", "offline",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Ask {
                action,
                text,
                target_language,
                mode,
                ..
            }) => {
                assert_eq!(action, Action::Translate);
                assert_eq!(text.as_deref(), Some("print(1)"));
                assert_eq!(target_language.as_deref(), Some("rust"));
                assert_eq!(mode, Some(Mode::Offline));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ask_rejects_unknown_action() {
        assert!(Cli::try_parse_from(["aide", "ask", "refactor", "x"]).is_err());
    }

    #[test]
    fn init_writes_defaults_and_refuses_to_overwrite() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config/default.toml");

        run_init(&path, false).unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("port = 8765"));
        assert!(raw.contains("openai_api_key = \"\""));

        assert!(run_init(&path, false).is_err());
        run_init(&path, true).unwrap();
    }

    #[test]
    fn read_content_prefers_text_then_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("code.py");
        fs::write(&path, "x = 1\n").unwrap();

        assert_eq!(read_content(Some("inline".into()), Some(&path)).unwrap(), "inline");
        assert_eq!(read_content(None, Some(&path)).unwrap(), "x = 1\n");
        assert!(read_content(Some("   ".into()), None).is_err());
    }
}
