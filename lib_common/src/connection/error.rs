use std::time::Duration;

use thiserror::Error;

use crate::configs::ConfigError;
use crate::protocol::ProtocolError;

/// # Connection Error
///
/// Transport failures are recoverable: they leave the engine disconnected and
/// the watchdog rebuilds the session. Server refusals during the handshake are
/// reported the same way so the caller can log them with the reason.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("Not connected to the server")]
    NotConnected,

    #[error("No response to '{tag}' within {timeout:?}")]
    ResponseTimeout { tag: String, timeout: Duration },

    #[error("Server refused '{tag}': {reason}")]
    Rejected { tag: String, reason: String },

    #[error("Connection engine is shut down")]
    ShutDown,

    #[error("Session closed before '{0}' was answered")]
    SessionClosed(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
