//! Error types for the RPC bridge.
//!
//! Everything that goes wrong after a successful handshake and a parsed request
//! ends up as the `error` string of a response envelope. These types give each
//! failure a stable, human-readable message.

use super::params::ParamType;

/// Failure while building the method registry at startup.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("An RPC with the name {name} is already known (registered by {existing})")]
    DuplicateMethod { name: String, existing: String },

    #[error("A receiver type named {0} is already registered")]
    DuplicateReceiver(String),

    #[error("Invalid default for parameter {param} of {method}: {reason}")]
    InvalidDefault {
        method: String,
        param: String,
        reason: String,
    },
}

/// Failure converting wire values into call-ready arguments.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConversionError {
    #[error("Too many parameters specified: expected at most {expected}, got {received}")]
    TooManyParameters { expected: usize, received: usize },

    #[error("Argument {position} ({name}) is not present")]
    MissingArgument { position: usize, name: String },

    #[error("Argument {position} ({name}) must not be null")]
    NullNotAllowed { position: usize, name: String },

    #[error("Argument {position} ({name}) should be of type {expected}, got {received}")]
    TypeMismatch {
        position: usize,
        name: String,
        expected: ParamType,
        received: &'static str,
    },

    #[error("Argument {position} ({name}) is out of range for {expected}")]
    OutOfRange {
        position: usize,
        name: String,
        expected: ParamType,
    },

    #[error("'{literal}' is not a valid {expected} default")]
    BadLiteral { literal: String, expected: ParamType },
}

/// Failure obtaining a receiver instance.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("Unknown receiver type: {0}")]
    Unknown(String),

    #[error("Failed to construct receiver {name}: {reason}")]
    Construction { name: String, reason: String },

    #[error("Session is shut down; receiver {0} is no longer available")]
    SessionClosed(String),
}

/// Failure of a single dispatched request. Rendered into the response's
/// `error` field.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown RPC: {0}")]
    MethodNotFound(String),

    #[error(transparent)]
    BadParameters(#[from] ConversionError),

    #[error(transparent)]
    Receiver(#[from] ReceiverError),

    #[error("{0}")]
    Invocation(String),

    #[error("Invocation of {0} was cancelled")]
    Cancelled(String),
}

/// Failure on the connection itself. Closes the connection without a
/// response.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake not completed within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("Handshake rejected")]
    HandshakeRejected,

    #[error("Connection closed before handshake")]
    ClosedBeforeHandshake,

    #[error("Malformed request: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Failed to encode response: {0}")]
    Encode(#[source] serde_json::Error),
}
