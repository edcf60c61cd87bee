use thiserror::Error;
use tokio_rustls::rustls;

/// Crate-wide error type capturing common failure cases.
#[derive(Debug, Error)]
pub enum MumletError {
    /// Input parameters failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A connect was attempted while a connection is already active.
    #[error("already connected")]
    AlreadyConnected,
    /// Networking failure while communicating with the server.
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    /// TLS handshake or certificate validation failure.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    /// Protocol-level violation or serialization failure.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Server rejected the authentication attempt.
    #[error("server rejected connection: {0}")]
    Rejected(String),
    /// Operation timed out waiting for a server response.
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Operation requires an established session.
    #[error("not connected")]
    NotConnected,
}
