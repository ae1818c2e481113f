use std::path::PathBuf;

use thiserror::Error;

use crate::protocol::RequestId;

/// Failures while locating or launching the backend process.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no usable backend runtime found (tried: {})", .candidates.join(", "))]
    RuntimeNotFound { candidates: Vec<String> },

    #[error("backend script not found at {}", .0.display())]
    ScriptNotFound(PathBuf),

    #[error("failed to launch backend `{command}`: {source}")]
    ProcessLaunchFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend did not become ready: {0}")]
    NotReady(String),
}

/// Failures surfaced by the connection manager for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("not connected to the AI backend")]
    NotConnected,

    #[error("AI backend unavailable after {attempts} reconnect attempts")]
    BackendUnavailable { attempts: u32 },

    #[error("request {request_id} timed out after {timeout_ms}ms")]
    RequestTimeout { request_id: RequestId, timeout_ms: u64 },

    #[error("malformed message from backend: {0}")]
    MalformedResponse(String),

    #[error("a request for `{0}` is already pending")]
    TargetBusy(String),

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("connection manager has shut down")]
    Shutdown,
}

/// What a UI caller sees when an AI request does not produce text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// The editor keeps working; only AI features are affected.
    #[error("AI backend unavailable")]
    BackendUnavailable,

    #[error("backend reported an error: {0}")]
    Backend(String),

    #[error(transparent)]
    Connection(ConnectionError),
}

impl From<ConnectionError> for DispatchError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::NotConnected | ConnectionError::BackendUnavailable { .. } => {
                DispatchError::BackendUnavailable
            }
            other => DispatchError::Connection(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_connected_maps_to_backend_unavailable() {
        assert_eq!(
            DispatchError::from(ConnectionError::NotConnected),
            DispatchError::BackendUnavailable
        );
        assert_eq!(
            DispatchError::from(ConnectionError::BackendUnavailable { attempts: 5 }),
            DispatchError::BackendUnavailable
        );
        assert_eq!(
            DispatchError::from(ConnectionError::TargetBusy("panel".into())),
            DispatchError::Connection(ConnectionError::TargetBusy("panel".into()))
        );
    }

    #[test]
    fn runtime_not_found_lists_candidates() {
        let err = SupervisorError::RuntimeNotFound {
            candidates: vec!["python3".into(), "py".into()],
        };
        assert_eq!(err.to_string(), "no usable backend runtime found (tried: python3, py)");
    }
}
