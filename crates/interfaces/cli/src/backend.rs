use std::io::Write;

use anyhow::Result;
use tracing::{info, warn};

use aide_config::AppConfig;
use aide_llm::Engine;
use aide_runtime::{BackendServer, SocketLimits};

/// `aide serve`: the backend process. Prints the ready marker on stdout once
/// the listener is bound and runs until SIGINT/SIGTERM.
pub(crate) async fn run_serve(
    mut config: AppConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    if let Some(host) = host {
        config.connection.host = host;
    }
    if let Some(port) = port {
        config.connection.port = port;
    }

    let engine = Engine::discover(&config.engine).await;
    let server = BackendServer::bind(&config.connection.bind_addr(), engine)
        .await?
        .with_limits(SocketLimits::from(&config.connection));
    info!(addr = %server.local_addr()?, "AI backend starting");

    announce_ready(&config.backend.ready_marker)?;
    server.run_until(shutdown_signal()).await?;
    info!("AI backend stopped");
    Ok(())
}

fn announce_ready(marker: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{marker}")?;
    stdout.flush()?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("SIGTERM received"),
                    _ = sigint.recv() => info!("SIGINT received"),
                }
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(?err, "cannot install signal handlers; waiting for ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
