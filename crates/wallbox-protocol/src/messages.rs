//! Device protocol messages.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Payload of the `hello` message the device sends on connect.
#[derive(Debug, Clone, Deserialize)]
pub struct HelloPayload {
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    /// Device serial number. Seeds the session secret derivation; the
    /// handshake cannot proceed without it.
    pub serial: String,
    #[serde(default)]
    pub version: Option<String>,
    pub manufacturer: String,
    pub devicetype: String,
    pub protocol: f64,
    #[serde(default)]
    pub secured: bool,
}

/// Payload of the `authRequired` challenge.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthChallenge {
    pub token1: String,
    pub token2: String,
}

/// Payload of a `fullStatus` snapshot. The device streams large snapshots
/// as a run of partial frames terminated by one with `partial: false`.
#[derive(Debug, Clone, Deserialize)]
pub struct FullStatusPayload {
    pub partial: bool,
    pub status: Map<String, Value>,
}

/// Payload of a `deltaStatus` incremental update.
#[derive(Debug, Clone, Deserialize)]
pub struct DeltaStatusPayload {
    pub status: Map<String, Value>,
}

/// An inbound message from the device, one variant per known `type` tag.
#[derive(Debug, Clone)]
pub enum DeviceMessage {
    Hello(HelloPayload),
    AuthRequired(AuthChallenge),
    AuthSuccess,
    AuthError,
    FullStatus(FullStatusPayload),
    DeltaStatus(DeltaStatusPayload),
    /// Reserved for request correlation; currently unused.
    Response(Value),
    ClearInverters(Value),
    UpdateInverter(Value),
}

impl DeviceMessage {
    /// Decode a raw JSON frame into a typed message.
    ///
    /// Returns `Ok(None)` when the frame carries no `type` field or an
    /// unrecognized tag — such frames are ignorable, not errors, so the
    /// client survives protocol extensions. A known tag whose payload
    /// fails to decode is a [`ProtocolError::Malformed`] fault.
    pub fn from_value(value: Value) -> Result<Option<Self>, ProtocolError> {
        let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
            return Ok(None);
        };

        let message = match kind.as_str() {
            "hello" => Self::Hello(payload(&kind, value)?),
            "authRequired" => Self::AuthRequired(payload(&kind, value)?),
            "authSuccess" => Self::AuthSuccess,
            "authError" => Self::AuthError,
            "fullStatus" => Self::FullStatus(payload(&kind, value)?),
            "deltaStatus" => Self::DeltaStatus(payload(&kind, value)?),
            "response" => Self::Response(value),
            "clearInverters" => Self::ClearInverters(value),
            "updateInverter" => Self::UpdateInverter(value),
            _ => return Ok(None),
        };

        Ok(Some(message))
    }

    /// The wire tag of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::AuthRequired(_) => "authRequired",
            Self::AuthSuccess => "authSuccess",
            Self::AuthError => "authError",
            Self::FullStatus(_) => "fullStatus",
            Self::DeltaStatus(_) => "deltaStatus",
            Self::Response(_) => "response",
            Self::ClearInverters(_) => "clearInverters",
            Self::UpdateInverter(_) => "updateInverter",
        }
    }
}

fn payload<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed {
        kind: kind.to_owned(),
        source,
    })
}

/// An outbound message to the device.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutgoingMessage {
    /// Response to an `authRequired` challenge.
    Auth { token3: String, hash: String },
    /// Write one property of the status document.
    #[serde(rename_all = "camelCase")]
    SetValue {
        request_id: u64,
        key: String,
        value: Value,
    },
}

impl OutgoingMessage {
    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Device identity, immutable once captured from the first `hello`.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub hostname: String,
    pub friendly_name: Option<String>,
    pub serial: String,
    pub version: Option<String>,
    pub manufacturer: String,
    pub devicetype: String,
    pub protocol: f64,
    pub secured: bool,
}

impl DeviceIdentity {
    /// Display name: the friendly name when the device announces one,
    /// otherwise its hostname.
    pub fn name(&self) -> &str {
        self.friendly_name.as_deref().unwrap_or(&self.hostname)
    }
}

impl From<HelloPayload> for DeviceIdentity {
    fn from(hello: HelloPayload) -> Self {
        Self {
            hostname: hello.hostname,
            friendly_name: hello.friendly_name,
            serial: hello.serial,
            version: hello.version,
            manufacturer: hello.manufacturer,
            devicetype: hello.devicetype,
            protocol: hello.protocol,
            secured: hello.secured,
        }
    }
}
