//! Error types for the control socket client.

use thiserror::Error;

/// Errors talking to a glbd control socket.
#[derive(Debug, Error)]
pub enum GlbCtlError {
    /// The control socket could not be reached (resolution or TCP connect).
    #[error("cannot connect to glbd control socket at {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure on an established session.
    #[error("control socket io error: {0}")]
    Io(#[from] std::io::Error),

    /// glbd answered the command with something other than `Ok`.
    #[error("glbd rejected command: {0}")]
    Rejected(String),

    /// glbd refused the update because it does not know the destination.
    #[error("glbd has no such destination: {0}")]
    UnknownDestination(String),

    /// The socket closed before a reply was read.
    #[error("control socket closed before reply")]
    UnexpectedEof,
}

/// Result alias for control socket operations.
pub type Result<T> = std::result::Result<T, GlbCtlError>;
