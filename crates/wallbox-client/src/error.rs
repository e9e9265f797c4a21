//! Client error types.

use thiserror::Error;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket transport error. Fatal to the session, never retried
    /// internally.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A known message type arrived with a malformed payload.
    #[error("decode fault: {0}")]
    Decode(#[from] wallbox_protocol::ProtocolError),

    /// Credential derivation failed.
    #[error("handshake failure: {0}")]
    Handshake(#[from] wallbox_handshake::HandshakeError),

    /// The device rejected the authentication response.
    #[error("device rejected authentication")]
    AuthenticationFailed,

    /// The connection ended before the handshake completed.
    #[error("connection closed during handshake")]
    ConnectionClosed,

    /// `connect` was called on a client that is not disconnected.
    #[error("already connected")]
    AlreadyConnected,

    /// No active connection.
    #[error("not connected to a device")]
    NotConnected,

    /// The status document has not completed its first full sync.
    #[error("status document not yet synced")]
    NotReady,

    /// The property name is unknown to the status document.
    #[error("unknown property: {0}")]
    NotFound(String),

    /// The outbound message queue is gone.
    #[error("failed to send message: {0}")]
    Send(String),
}

/// Result type alias using ClientError.
pub type ClientResult<T> = Result<T, ClientError>;
