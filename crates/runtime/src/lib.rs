mod connection;
mod context;
mod dispatcher;
mod error;
mod events;
mod keepalive;
pub mod protocol;
mod server;
mod supervisor;
pub mod transcript;

pub use connection::{
    ConnectionManager, ConnectionState, ConnectionStatus, Connector, Inbound, Link, Outbound,
    PendingResponse, WebSocketConnector,
};
pub use context::AppContext;
pub use dispatcher::{AiRequest, RequestDispatcher};
pub use error::{ConnectionError, DispatchError, SupervisorError};
pub use events::{EventBus, ProcessEvent, ResponseEvent, StatusEvent, StatusKind, Topic};
pub use keepalive::SocketLimits;
pub use server::BackendServer;
pub use supervisor::{BackendProcess, BackendSupervisor, LaunchPlan, ProcessState};
pub use transcript::{Role, Transcript, TranscriptEntry};
