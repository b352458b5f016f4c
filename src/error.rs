//! Error types for turnlink
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using LinkError
pub type Result<T> = std::result::Result<T, LinkError>;

/// Unified error type for turnlink operations
#[derive(Debug, Error)]
pub enum LinkError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Duplicate argument: {0}")]
    DuplicateArgument(String),

    #[error("Command type already registered: {0}")]
    TypeConflict(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Connection Errors
    // -------------------------------------------------------------------------
    #[error("Outbound queue is not running")]
    NotRunning,

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Connection rejected: {0}")]
    Rejected(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failures of the wire format and of the connection handshake.
///
/// Any of these is fatal to the one connection attempt that produced it and
/// never to the server as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown command type '{0}'")]
    UnknownType(String),

    #[error("unknown argument tag {0}")]
    UnknownArgumentTag(u8),

    #[error("unknown client (bad magic 0x{0:016x})")]
    BadMagic(u64),

    #[error("missing version")]
    MissingVersion,

    #[error("incompatible version: server {server}, client {client}")]
    IncompatibleVersion { server: String, client: String },

    #[error("bad password")]
    BadPassword,

    #[error("duplicate name '{0}'")]
    DuplicateName(String),

    #[error("'{0}' is banned")]
    Banned(String),

    #[error("max connections reached ({0})")]
    MaxConnections(usize),

    #[error("server stopping")]
    ServerStopping,

    #[error("malformed: {0}")]
    Malformed(String),

    #[error("string too long: {0} bytes")]
    StringTooLong(usize),

    #[error("invalid modified UTF-8")]
    InvalidUtf8,
}

impl LinkError {
    /// True when the error means the peer went away rather than misbehaved
    pub fn is_disconnect(&self) -> bool {
        match self {
            LinkError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }

    /// True when a socket read timed out
    pub fn is_timeout(&self) -> bool {
        match self {
            // Windows uses TimedOut instead of WouldBlock
            LinkError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl From<bincode::Error> for LinkError {
    fn from(e: bincode::Error) -> Self {
        LinkError::Serialization(e.to_string())
    }
}
