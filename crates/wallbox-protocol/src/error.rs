//! Protocol error types.

use thiserror::Error;

/// Errors from decoding or encoding wire messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A frame declared a known message type but its payload does not
    /// match the expected shape (missing or mistyped load-bearing field).
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    /// JSON serialization error on an outgoing message.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
