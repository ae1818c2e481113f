//! Client side of the backend channel.
//!
//! [`ConnectionManager`] is a cheap handle onto a single actor task that owns
//! the socket, the reconnect schedule and the pending-request table. Every
//! state change happens on that task, so timeouts, responses and connection
//! loss cannot race each other over a pending entry.

mod pending;
mod transport;


use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use aide_config::{ConnectionConfig, Correlation};

use crate::error::ConnectionError;
use crate::events::{EventBus, ResponseEvent, StatusEvent, StatusKind};
use crate::protocol::{InboundMessage, RequestEnvelope, RequestId, ResponseEnvelope};

use pending::{PendingEntry, PendingTable};

pub use transport::{Connector, Inbound, Link, Outbound, WebSocketConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

/// Point-in-time view of the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempt: u32,
    /// Reconnect attempts are exhausted; only an explicit `connect()` retries.
    pub unavailable: bool,
    pub pending: usize,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Idle,
            reconnect_attempt: 0,
            unavailable: false,
            pending: 0,
            last_error: None,
        }
    }
}

/// A request that was written to the backend and awaits its response.
#[derive(Debug)]
pub struct PendingResponse {
    pub request_id: RequestId,
    rx: oneshot::Receiver<Result<ResponseEnvelope, ConnectionError>>,
}

impl PendingResponse {
    /// Resolves exactly once: with the matched response, a timeout, or
    /// [`ConnectionError::Shutdown`] when the manager goes away first.
    pub async fn wait(self) -> Result<ResponseEnvelope, ConnectionError> {
        self.rx.await.unwrap_or(Err(ConnectionError::Shutdown))
    }
}

enum Command {
    Connect,
    Send {
        envelope: RequestEnvelope,
        target: Option<String>,
        reply: oneshot::Sender<Result<PendingResponse, ConnectionError>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Results of work the actor spawned, fed back into its loop.
enum Signal {
    ConnectFinished {
        generation: u64,
        result: anyhow::Result<Link>,
    },
    RetryDue {
        generation: u64,
    },
    TimedOut {
        request_id: RequestId,
    },
}

#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionManager {
    /// Spawn the actor on the current runtime. Nothing connects until
    /// [`connect`](Self::connect) is called.
    pub fn spawn(config: ConnectionConfig, connector: Arc<dyn Connector>, bus: EventBus) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus::initial());

        let actor = ConnectionActor {
            config,
            connector,
            bus,
            status_tx,
            signals,
            state: ConnectionState::Idle,
            reconnect_attempt: 0,
            unavailable: false,
            last_error: None,
            generation: 0,
            outbound: None,
            inbound: None,
            pending: PendingTable::default(),
            next_request_id: 1,
        };
        tokio::spawn(actor.run(command_rx, signal_rx));

        Self { commands, status }
    }

    /// Begin connecting. A no-op while already connecting or open; after
    /// reconnects are exhausted this is the manual retry and starts the
    /// attempt counter over.
    pub fn connect(&self) {
        let _ = self.commands.send(Command::Connect);
    }

    /// Write `envelope` to the backend and register it as pending. Fails
    /// without touching the pending table when the channel is not open.
    pub async fn send(
        &self,
        envelope: RequestEnvelope,
        target: Option<String>,
    ) -> Result<PendingResponse, ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                envelope,
                target,
                reply,
            })
            .map_err(|_| ConnectionError::Shutdown)?;
        rx.await.unwrap_or(Err(ConnectionError::Shutdown))
    }

    /// Close the channel normally. Cancels any scheduled reconnect.
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.commands.send(Command::Close { done }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.status.borrow().state == ConnectionState::Open
    }

    /// Wait until the channel is open, failing early once reconnects are
    /// exhausted.
    pub async fn wait_until_open(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let mut status = self.status.clone();
        let wait = async {
            loop {
                {
                    let current = status.borrow_and_update();
                    if current.state == ConnectionState::Open {
                        return Ok(());
                    }
                    if current.unavailable {
                        return Err(ConnectionError::BackendUnavailable {
                            attempts: current.reconnect_attempt,
                        });
                    }
                }
                if status.changed().await.is_err() {
                    return Err(ConnectionError::Shutdown);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Err(ConnectionError::NotConnected))
    }
}

struct ConnectionActor {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    bus: EventBus,
    status_tx: watch::Sender<ConnectionStatus>,
    signals: mpsc::UnboundedSender<Signal>,

    state: ConnectionState,
    reconnect_attempt: u32,
    unavailable: bool,
    last_error: Option<String>,
    /// Bumped on every connect attempt and every close; stale connect
    /// results and retry timers carry an older value and are ignored.
    generation: u64,

    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    inbound: Option<mpsc::UnboundedReceiver<Inbound>>,
    pending: PendingTable,
    next_request_id: RequestId,
}

impl ConnectionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(signal) = signals.recv() => self.handle_signal(signal),
                inbound = next_inbound(&mut self.inbound) => self.handle_inbound(inbound),
            }
            self.sync_status();
        }

        debug!("connection manager dropped; shutting down");
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Outbound::Close);
        }
        self.pending.clear();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => match self.state {
                ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closing => {
                    debug!(state = self.state.as_str(), "connect ignored");
                }
                ConnectionState::Idle | ConnectionState::Closed => {
                    self.reconnect_attempt = 0;
                    self.unavailable = false;
                    self.begin_connect();
                }
            },
            Command::Send {
                envelope,
                target,
                reply,
            } => {
                let result = self.send(envelope, target);
                self.sync_status();
                let _ = reply.send(result);
            }
            Command::Close { done } => {
                self.close();
                self.sync_status();
                let _ = done.send(());
            }
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::ConnectFinished { generation, result } => {
                self.on_connect_finished(generation, result)
            }
            Signal::RetryDue { generation } => {
                if generation == self.generation
                    && self.state == ConnectionState::Closed
                    && !self.unavailable
                {
                    self.begin_connect();
                }
            }
            Signal::TimedOut { request_id } => {
                if let Some(entry) = self.pending.remove(request_id) {
                    let timeout_ms = self.config.request_timeout_ms;
                    warn!(
                        request_id,
                        elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
                        "request timed out"
                    );
                    let err = ConnectionError::RequestTimeout {
                        request_id,
                        timeout_ms,
                    };
                    self.bus.responses.publish(ResponseEvent {
                        request_id,
                        target: entry.target.clone(),
                        outcome: Err(err.clone()),
                    });
                    self.sync_status();
                    entry.resolve(Err(err));
                }
            }
        }
    }

    fn handle_inbound(&mut self, inbound: Option<Inbound>) {
        match inbound {
            Some(Inbound::Text(text)) => self.handle_message(&text),
            Some(Inbound::Closed { normal, reason }) => self.on_link_closed(normal, reason),
            None => self.on_link_closed(false, Some("transport stopped".to_string())),
        }
    }

    fn handle_message(&mut self, text: &str) {
        let envelope = match InboundMessage::parse(text) {
            Ok(InboundMessage::Greeting { message }) => {
                info!(%message, "backend greeting");
                self.publish_status(StatusKind::Greeting { message });
                return;
            }
            Ok(InboundMessage::Response(envelope)) => envelope,
            Err(err) => {
                warn!(?err, "malformed message from backend");
                self.publish_status(StatusKind::Error(ConnectionError::MalformedResponse(
                    err.to_string(),
                )));
                return;
            }
        };

        // An echoed id that is no longer pending belongs to a request that
        // already timed out or was issued on an earlier link.
        let entry = match (self.config.correlation, envelope.request_id) {
            (_, Some(request_id)) if !self.pending.is_attached(request_id) => {
                debug!(request_id, "late response for a settled request dropped");
                return;
            }
            (Correlation::RequestId, Some(request_id)) => self.pending.take_attached(request_id),
            _ => self.pending.take_oldest_attached(),
        };
        let Some(entry) = entry else {
            debug!(
                request_id = ?envelope.request_id,
                "response with no matching pending request dropped"
            );
            return;
        };

        debug!(
            request_id = entry.request_id,
            elapsed_ms = entry.issued_at.elapsed().as_millis() as u64,
            success = envelope.success,
            "response matched"
        );
        self.bus.responses.publish(ResponseEvent {
            request_id: entry.request_id,
            target: entry.target.clone(),
            outcome: Ok(envelope.clone()),
        });
        self.sync_status();
        entry.resolve(Ok(envelope));
    }

    fn send(
        &mut self,
        mut envelope: RequestEnvelope,
        target: Option<String>,
    ) -> Result<PendingResponse, ConnectionError> {
        let outbound = match (&self.outbound, self.state) {
            (Some(outbound), ConnectionState::Open) => outbound.clone(),
            _ if self.unavailable => {
                return Err(ConnectionError::BackendUnavailable {
                    attempts: self.config.max_reconnect_attempts,
                });
            }
            _ => return Err(ConnectionError::NotConnected),
        };

        if let Some(target) = &target {
            if self.pending.target_busy(target) {
                return Err(ConnectionError::TargetBusy(target.clone()));
            }
        }

        let request_id = self.next_request_id;
        envelope.request_id = Some(request_id);
        let text = serde_json::to_string(&envelope)
            .map_err(|err| ConnectionError::Encode(err.to_string()))?;
        if outbound.send(Outbound::Text(text)).is_err() {
            return Err(ConnectionError::NotConnected);
        }
        self.next_request_id += 1;

        let signals = self.signals.clone();
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = signals.send(Signal::TimedOut { request_id });
        });

        let (reply, rx) = oneshot::channel();
        self.pending
            .insert(PendingEntry::new(request_id, target, timer.abort_handle(), reply));
        debug!(request_id, action = %envelope.action, "request sent");

        Ok(PendingResponse { request_id, rx })
    }

    fn close(&mut self) {
        self.generation += 1;
        let was_active = matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Connecting
        );
        if let Some(outbound) = self.outbound.take() {
            self.set_state(ConnectionState::Closing);
            let _ = outbound.send(Outbound::Close);
        }
        self.inbound = None;
        self.pending.detach_all();

        if self.state != ConnectionState::Idle {
            self.set_state(ConnectionState::Closed);
        }
        if was_active {
            info!("connection closed");
            self.publish_status(StatusKind::Disconnected {
                normal: true,
                reason: None,
            });
        }
    }

    fn begin_connect(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.set_state(ConnectionState::Connecting);
        self.publish_status(StatusKind::Connecting {
            attempt: self.reconnect_attempt,
        });
        info!(url = %self.config.url(), attempt = self.reconnect_attempt, "connecting");

        let connector = self.connector.clone();
        let signals = self.signals.clone();
        tokio::spawn(async move {
            let result = connector.connect().await;
            let _ = signals.send(Signal::ConnectFinished { generation, result });
        });
    }

    fn on_connect_finished(&mut self, generation: u64, result: anyhow::Result<Link>) {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            if let Ok(link) = result {
                let _ = link.outbound.send(Outbound::Close);
            }
            return;
        }

        match result {
            Ok(link) => {
                self.outbound = Some(link.outbound);
                self.inbound = Some(link.inbound);
                self.reconnect_attempt = 0;
                self.last_error = None;
                self.set_state(ConnectionState::Open);
                info!("connected to AI backend");
                self.publish_status(StatusKind::Connected);
            }
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(%reason, "connect failed");
                self.last_error = Some(reason.clone());
                self.set_state(ConnectionState::Closed);
                self.publish_status(StatusKind::ConnectFailed { reason });
                self.schedule_retry();
            }
        }
    }

    fn on_link_closed(&mut self, normal: bool, reason: Option<String>) {
        self.outbound = None;
        self.inbound = None;
        let detached = self.pending.detach_all();
        if !normal {
            self.last_error = reason.clone();
        }
        self.set_state(ConnectionState::Closed);

        if normal {
            info!(detached, "backend closed the connection");
        } else {
            warn!(?reason, detached, "connection lost");
        }
        self.publish_status(StatusKind::Disconnected { normal, reason });

        if !normal {
            self.schedule_retry();
        }
    }

    /// Retry `n` waits `base * n`. Past the limit the manager gives up and
    /// reports the backend unavailable, once.
    fn schedule_retry(&mut self) {
        if self.reconnect_attempt < self.config.max_reconnect_attempts {
            self.reconnect_attempt += 1;
            let delay = Duration::from_millis(
                self.config
                    .reconnect_base_delay_ms
                    .saturating_mul(u64::from(self.reconnect_attempt)),
            );
            info!(attempt = self.reconnect_attempt, ?delay, "scheduling reconnect");
            self.publish_status(StatusKind::Reconnecting {
                attempt: self.reconnect_attempt,
                delay,
            });

            let generation = self.generation;
            let signals = self.signals.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = signals.send(Signal::RetryDue { generation });
            });
        } else if !self.unavailable {
            self.unavailable = true;
            error!(
                attempts = self.reconnect_attempt,
                "AI backend unavailable; giving up until a manual reconnect"
            );
            self.publish_status(StatusKind::BackendUnavailable {
                attempts: self.reconnect_attempt,
            });
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = self.state.as_str(), to = state.as_str(), "connection state");
            self.state = state;
        }
        self.sync_status();
    }

    fn publish_status(&self, kind: StatusKind) {
        self.bus.status.publish(StatusEvent {
            state: self.state,
            kind,
        });
    }

    fn sync_status(&self) {
        let snapshot = ConnectionStatus {
            state: self.state,
            reconnect_attempt: self.reconnect_attempt,
            unavailable: self.unavailable,
            pending: self.pending.len(),
            last_error: self.last_error.clone(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

/// Next frame from the current link; pends forever when there is none.
async fn next_inbound(inbound: &mut Option<mpsc::UnboundedReceiver<Inbound>>) -> Option<Inbound> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
