//! WebSocket limits and ping keepalive shared by the backend server and the
//! client transport.

use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use aide_config::ConnectionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketLimits {
    /// Zero disables pings.
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub max_message_bytes: usize,
}

impl From<&ConnectionConfig> for SocketLimits {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            ping_interval: Duration::from_millis(config.ping_interval_ms),
            ping_timeout: Duration::from_millis(config.ping_timeout_ms),
            max_message_bytes: config.max_message_bytes,
        }
    }
}

impl Default for SocketLimits {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl SocketLimits {
    pub(crate) fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: Some(self.max_message_bytes),
            max_frame_size: Some(self.max_message_bytes),
            ..WebSocketConfig::default()
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Beat {
    /// Send a ping now.
    Ping,
    /// The last ping went unanswered for the whole timeout.
    Expired,
}

/// Ping schedule for one socket. Only pongs count as liveness.
pub(crate) struct Heartbeat {
    interval: Option<Duration>,
    timeout: Duration,
    next_ping: Instant,
    deadline: Option<Instant>,
}

impl Heartbeat {
    pub fn new(limits: &SocketLimits) -> Self {
        Self {
            interval: (!limits.ping_interval.is_zero()).then_some(limits.ping_interval),
            timeout: limits.ping_timeout,
            next_ping: Instant::now() + limits.ping_interval,
            deadline: None,
        }
    }

    /// Resolves when the next ping is due or the outstanding one expires.
    /// State only changes after the sleep completes, so this is safe to use
    /// as a `select!` branch.
    pub async fn due(&mut self) -> Beat {
        if self.interval.is_none() {
            return std::future::pending().await;
        }
        match self.deadline {
            Some(deadline) => {
                sleep_until(deadline).await;
                Beat::Expired
            }
            None => {
                sleep_until(self.next_ping).await;
                self.deadline = Some(Instant::now() + self.timeout);
                Beat::Ping
            }
        }
    }

    pub fn pong(&mut self) {
        if let Some(interval) = self.interval {
            self.deadline = None;
            self.next_ping = Instant::now() + interval;
        }
    }
}
