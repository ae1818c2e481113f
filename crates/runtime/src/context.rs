use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use aide_config::AppConfig;

use crate::connection::{ConnectionManager, Connector, WebSocketConnector};
use crate::dispatcher::RequestDispatcher;
use crate::error::SupervisorError;
use crate::events::EventBus;
use crate::keepalive::SocketLimits;
use crate::supervisor::BackendSupervisor;
use crate::transcript::Transcript;

/// Everything a UI surface needs, created once at startup and passed
/// explicitly to whoever needs it.
pub struct AppContext {
    pub config: AppConfig,
    pub bus: EventBus,
    pub supervisor: Arc<BackendSupervisor>,
    pub connection: ConnectionManager,
    pub dispatcher: RequestDispatcher,
    pub transcript: Option<Transcript>,
}

impl AppContext {
    /// Must be called inside a Tokio runtime.
    pub fn new(config: AppConfig) -> Self {
        let connector = Arc::new(
            WebSocketConnector::new(config.connection.url())
                .with_limits(SocketLimits::from(&config.connection)),
        );
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: AppConfig, connector: Arc<dyn Connector>) -> Self {
        let bus = EventBus::new();
        let supervisor = Arc::new(BackendSupervisor::new(config.backend.clone(), bus.clone()));
        let connection =
            ConnectionManager::spawn(config.connection.clone(), connector, bus.clone());
        let transcript = config
            .transcript
            .enabled
            .then(|| Transcript::new(&config.transcript.dir));
        let dispatcher = RequestDispatcher::new(
            connection.clone(),
            bus.clone(),
            transcript.clone(),
            config.chat.clone(),
        );

        Self {
            config,
            bus,
            supervisor,
            connection,
            dispatcher,
            transcript,
        }
    }

    /// Start the backend (when `autostart` is set), wait for it to report
    /// ready, then begin connecting.
    ///
    /// Backend failures are returned for display but are not fatal: the
    /// connection attempt happens regardless, since the backend may be
    /// running outside our control.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut outcome = Ok(());
        if self.config.backend.autostart {
            let ready_timeout = Duration::from_millis(self.config.backend.ready_timeout_ms);
            outcome = match self.supervisor.start().await {
                Ok(()) => self.supervisor.wait_until_ready(ready_timeout).await,
                Err(err) => Err(err),
            };
            if let Err(err) = &outcome {
                warn!(%err, "backend did not start; AI features may be unavailable");
            }
        }
        self.connection.connect();
        outcome
    }

    /// Close the channel, then stop the backend gracefully.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.connection.close().await;
        self.supervisor.stop(true).await;
    }
}
