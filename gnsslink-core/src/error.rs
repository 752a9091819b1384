//! Error types for protocol parsing and the stateful clients

use thiserror::Error;

/// Errors that can occur when decoding receiver frames
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Payload is too short to contain the declared layout
    #[error("Payload too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// Frame header doesn't match expected format
    #[error("Invalid header: expected {expected:02X?}, got {actual:02X?}")]
    InvalidHeader {
        expected: Vec<u8>,
        actual: Vec<u8>,
    },

    /// A text line could not be split into the expected sections
    #[error("Malformed sentence: {0}")]
    MalformedSentence(String),

    /// Invalid frame data
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Errors raised while building a schema catalog
#[derive(Error, Debug)]
pub enum SchemaError {
    /// Catalog JSON could not be deserialized
    #[error("Invalid schema catalog: {0}")]
    Json(#[from] serde_json::Error),

    /// Two layouts claim the same message id
    #[error("Duplicate message id {0} in schema catalog")]
    DuplicateId(u16),

    /// A field declares a zero element count or length
    #[error("Field '{field}' of '{message}' has an invalid size")]
    InvalidFieldSize { message: String, field: String },
}

/// Errors resolved into device query futures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The receiver answered with an error line
    #[error("Device rejected query: {0}")]
    Device(String),

    /// The query command could not be written to the transport
    #[error("Failed to send query: {0}")]
    Io(String),

    /// The query engine was shut down before the query completed
    #[error("Query cancelled")]
    Cancelled,
}

/// Errors resolved into NTRIP futures and results
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NtripError {
    /// The caster answered with a non-200 status line (terminal)
    #[error("Caster rejected request: {0}")]
    Rejected(String),

    /// Network failure; the client may reconnect
    #[error("Connection failed: {0}")]
    Network(String),

    /// The caster response did not follow the protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A connect or source-table request is already running
    #[error("Operation already in progress")]
    Busy,

    /// The operation was cancelled by disconnect/shutdown
    #[error("Operation cancelled")]
    Cancelled,
}
