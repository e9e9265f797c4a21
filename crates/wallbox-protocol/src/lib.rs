//! Wire protocol types for the wallbox device connection.
//!
//! The device speaks JSON text frames over a WebSocket. Every frame is an
//! object whose `type` field selects the message shape. Inbound frames are
//! decoded through [`DeviceMessage::from_value`], which maps unknown or
//! untyped frames to `None` so the connection tolerates protocol
//! extensions; outbound frames are built with [`OutgoingMessage`].

mod error;
mod messages;

pub use error::ProtocolError;
pub use messages::{
    AuthChallenge, DeltaStatusPayload, DeviceIdentity, DeviceMessage, FullStatusPayload,
    HelloPayload, OutgoingMessage,
};
