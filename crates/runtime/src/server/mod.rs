//! Backend WebSocket server: accepts editor connections and answers AI
//! requests with the response engine.

mod connection;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info};

use aide_llm::Engine;

use crate::keepalive::SocketLimits;

pub struct BackendServer {
    listener: TcpListener,
    engine: Arc<Engine>,
    limits: SocketLimits,
}

impl BackendServer {
    pub async fn bind(addr: &str, engine: Engine) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind backend server on {addr}"))?;
        Ok(Self {
            listener,
            engine: Arc::new(engine),
            limits: SocketLimits::default(),
        })
    }

    pub fn with_limits(mut self, limits: SocketLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves. Open connections are
    /// dropped when it does.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "backend server listening");

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accept = self.listener.accept() => {
                    let (stream, peer) = match accept {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            error!(?err, "accept failed");
                            continue;
                        }
                    };
                    let engine = self.engine.clone();
                    let limits = self.limits;
                    connections.spawn(async move {
                        if let Err(err) = connection::handle_connection(stream, peer, engine, limits).await {
                            error!(%peer, ?err, "backend connection failed");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(open = connections.len(), "backend server shutting down");
        connections.shutdown().await;
        Ok(())
    }
}
