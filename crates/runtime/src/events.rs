//! Typed publish/subscribe topics shared by the supervisor, the connection
//! manager and the UI surfaces.

use std::fmt;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::trace;

use crate::connection::ConnectionState;
use crate::error::ConnectionError;
use crate::protocol::{RequestId, ResponseEnvelope};
use crate::supervisor::ProcessState;
use crate::transcript::TranscriptEntry;

/// Broadcast channel capacity. Old events are dropped when subscribers lag.
const TOPIC_CAPACITY: usize = 256;

/// A named broadcast channel. Publishing never blocks and never fails; events
/// published with no subscribers are discarded.
pub struct Topic<T> {
    name: &'static str,
    tx: broadcast::Sender<T>,
}

impl<T> Clone for Topic<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone + fmt::Debug> Topic<T> {
    pub fn new(name: &'static str) -> Self {
        let (tx, _) = broadcast::channel(TOPIC_CAPACITY);
        Self { name, tx }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn publish(&self, event: T) {
        trace!(topic = self.name, ?event, "publish");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T> fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("subscribers", &self.tx.receiver_count())
            .finish()
    }
}

// ── Event payloads ───────────────────────────────────────────────────────────

/// Connection status change, published on the `status` topic.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub state: ConnectionState,
    pub kind: StatusKind,
}

impl StatusEvent {
    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusKind {
    Connecting { attempt: u32 },
    Connected,
    ConnectFailed { reason: String },
    Greeting { message: String },
    Disconnected { normal: bool, reason: Option<String> },
    Reconnecting { attempt: u32, delay: Duration },
    /// Published once when reconnect attempts are exhausted.
    BackendUnavailable { attempts: u32 },
    Error(ConnectionError),
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusKind::Connecting { attempt: 0 } => write!(f, "connecting to AI backend"),
            StatusKind::Connecting { attempt } => {
                write!(f, "connecting to AI backend (attempt {attempt})")
            }
            StatusKind::Connected => write!(f, "connected to AI backend"),
            StatusKind::ConnectFailed { reason } => write!(f, "connection failed: {reason}"),
            StatusKind::Greeting { message } => write!(f, "{message}"),
            StatusKind::Disconnected { normal: true, .. } => write!(f, "disconnected"),
            StatusKind::Disconnected { normal: false, reason } => match reason {
                Some(reason) => write!(f, "connection lost: {reason}"),
                None => write!(f, "connection lost"),
            },
            StatusKind::Reconnecting { attempt, delay } => write!(
                f,
                "reconnecting in {:.1}s (attempt {attempt})",
                delay.as_secs_f64()
            ),
            StatusKind::BackendUnavailable { attempts } => write!(
                f,
                "AI backend unavailable after {attempts} attempts; AI features are disabled"
            ),
            StatusKind::Error(err) => write!(f, "{err}"),
        }
    }
}

/// Resolution of one request, published on the `responses` topic.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEvent {
    pub request_id: RequestId,
    pub target: Option<String>,
    pub outcome: Result<ResponseEnvelope, ConnectionError>,
}

/// Backend process lifecycle change, published on the `backend` topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    pub state: ProcessState,
    pub message: String,
    pub exit_code: Option<i32>,
}

// ── Bus ──────────────────────────────────────────────────────────────────────

/// All topics the application publishes on. Cloning shares the channels.
#[derive(Debug, Clone)]
pub struct EventBus {
    pub status: Topic<StatusEvent>,
    pub responses: Topic<ResponseEvent>,
    pub backend: Topic<ProcessEvent>,
    pub transcript: Topic<TranscriptEntry>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            status: Topic::new("status"),
            responses: Topic::new("responses"),
            backend: Topic::new("backend"),
            transcript: Topic::new("transcript"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let topic: Topic<u32> = Topic::new("numbers");
        topic.publish(1);
        let mut rx = topic.subscribe();
        topic.publish(2);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let mut a = bus.backend.subscribe();
        let mut b = bus.clone().backend.subscribe();
        bus.backend.publish(ProcessEvent {
            state: ProcessState::Running,
            message: "ready".into(),
            exit_code: None,
        });
        assert_eq!(a.try_recv().unwrap().state, ProcessState::Running);
        assert_eq!(b.try_recv().unwrap().message, "ready");
    }

    #[test]
    fn status_messages_are_human_readable() {
        let event = StatusEvent {
            state: ConnectionState::Closed,
            kind: StatusKind::Reconnecting {
                attempt: 2,
                delay: Duration::from_secs(4),
            },
        };
        assert_eq!(event.message(), "reconnecting in 4.0s (attempt 2)");
        assert_eq!(
            StatusKind::BackendUnavailable { attempts: 5 }.to_string(),
            "AI backend unavailable after 5 attempts; AI features are disabled"
        );
    }
}
