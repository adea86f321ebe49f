//! Error definitions for the session layer and the embedded engine.

use thiserror::Error;

/// Error kinds surfaced by [`BrokerSession`](crate::session::BrokerSession)
/// and [`ClientSession`](crate::session::ClientSession) commands.
///
/// Engine-thread failures never cross the task boundary as panics; they are
/// converted to one of these kinds at the session boundary and, where the
/// command has already returned, delivered as a `StateChanged` event carrying
/// `last_error`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Broker port or bind address unusable.
    #[error("Bind error: {0}")]
    BindError(String),

    /// Client transport failure, auth rejection, or connect timeout.
    #[error("Connect error: {0}")]
    ConnectError(String),

    /// Command issued while the session is not connected.
    #[error("Not connected: {0}")]
    NotConnectedError(String),

    /// A second Start/Connect was issued while one is still pending.
    #[error("Already in progress: {0}")]
    AlreadyInProgressError(String),

    /// Broker rejected the publish or the transport failed mid-publish.
    #[error("Publish error: {0}")]
    PublishError(String),

    /// Unexpected failure inside the underlying engine.
    #[error("Engine fault: {0}")]
    EngineFault(String),
}

/// Errors produced by the embedded broker engine.
///
/// These stay inside the engine tasks; the session layer only ever sees them
/// as event payloads or converted into [`SessionError::EngineFault`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected packet on the wire.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Peer closed the socket without a DISCONNECT packet.
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// No packet within 1.5x the negotiated keep-alive interval.
    #[error("Keep-alive timeout")]
    KeepAliveTimeout,
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        SessionError::EngineFault(err.to_string())
    }
}
