use std::net::SocketAddr;

use thiserror::Error;

use crate::connection::ConnectionId;
use crate::protocol::ParseError;

/// Error types that can occur in the acceptor.
///
/// Listener-level faults (`Bind`, `Address`, `AlreadyStarted`, `Disposed`)
/// are returned to the caller of `start`. Per-connection faults (`Receive`,
/// `Parse`) never leave the connection task; they exist so the task can log
/// them with a uniform shape.
#[derive(Error, Debug)]
pub enum AcceptorError {
    /// The OS refused to bind the accept endpoint (usually: port still in use)
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The accept host could not be resolved
    #[error("cannot resolve accept address {host}:{port}")]
    Address { host: String, port: u16 },

    /// `start` was called on a listener that is already running
    #[error("listener for {0} is already started")]
    AlreadyStarted(String),

    /// Non-fatal I/O fault on a single connection
    #[error("receive error on connection {connection}: {source}")]
    Receive {
        connection: ConnectionId,
        #[source]
        source: std::io::Error,
    },

    /// Malformed or incomplete frame
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Operation attempted after `dispose`
    #[error("acceptor has been disposed")]
    Disposed,

    /// Configuration validation failed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AcceptorError {
    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AcceptorError::Bind { .. })
    }
}

pub type Result<T> = std::result::Result<T, AcceptorError>;
