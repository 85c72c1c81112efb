//! Error types for the router.
//!
//! Every variant here is contained to a single client connection or a single
//! backend session. Only listener bind/accept failures (plain `io::Error`)
//! are fatal for the process.

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Failure to bring a backend process to the ready state.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The backend program could not be executed.
    #[error("failed to exec backend {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Reading the backend's output failed before the readiness marker.
    #[error("failed reading backend output: {0}")]
    Output(#[source] io::Error),

    /// The backend closed its output before printing the readiness marker.
    #[error("backend output closed before ready (status: {status:?})")]
    OutputClosed { status: Option<ExitStatus> },

    /// The readiness marker did not appear in time.
    #[error("backend not ready after {0:?}")]
    ReadinessTimeout(Duration),
}

/// Failure to read the handshake token from a client.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The client closed the connection before sending a full token.
    #[error("short handshake: got {received} of {expected} bytes")]
    Short { received: usize, expected: usize },

    /// The client did not send a full token in time.
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake read failed: {0}")]
    Io(#[from] io::Error),
}

/// Session table invariant violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("a session for this token already exists")]
    DuplicateToken,

    #[error("port {0} is already held by a live session")]
    DuplicatePort(u16),

    /// A live session holds the highest port; nothing above it is left.
    #[error("no backend port left above the highest live session")]
    PortsExhausted,
}

/// Per-connection failure. Logged and the client connection is closed.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("cannot register session: {0}")]
    Table(#[from] TableError),

    /// Another connection was starting the backend for this token and failed.
    #[error("backend for port {port} failed to start")]
    BackendUnavailable { port: u16 },

    #[error("failed to dial backend {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("relay failed: {0}")]
    Relay(#[source] io::Error),
}

impl ConnectionError {
    /// Short, stable reason code for structured logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ConnectionError::Handshake(HandshakeError::Short { .. }) => "handshake_short",
            ConnectionError::Handshake(HandshakeError::Timeout(_)) => "handshake_timeout",
            ConnectionError::Handshake(HandshakeError::Io(_)) => "handshake_io",
            ConnectionError::Spawn(SpawnError::Exec { .. }) => "spawn_exec_failed",
            ConnectionError::Spawn(SpawnError::ReadinessTimeout(_)) => "spawn_readiness_timeout",
            ConnectionError::Spawn(_) => "spawn_output_failed",
            ConnectionError::Table(TableError::PortsExhausted) => "ports_exhausted",
            ConnectionError::Table(_) => "session_conflict",
            ConnectionError::BackendUnavailable { .. } => "backend_unavailable",
            ConnectionError::Dial { source, .. } if source.kind() == io::ErrorKind::TimedOut => {
                "dial_timeout"
            }
            ConnectionError::Dial { .. } => "dial_failed",
            ConnectionError::Relay(_) => "relay_io",
        }
    }
}
