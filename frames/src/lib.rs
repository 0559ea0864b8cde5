//! Frame model and protobuf codec for the streaming transport.
//!
//! Every logical exchange on the streaming channel is a sequence of frames
//! correlated by `parent_id`: `request → item* → done` or `request → error`.
//! A `cancel` frame whose `parent_id` names an open request aborts it.
//! Payloads stay flexible (`serde_json::Value`) while the envelope is encoded
//! as protobuf for compact binary transport.

use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error returned by [`decode_frame`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The raw bytes could not be decoded as a protobuf `WireFrame`.
    #[error("failed to decode protobuf frame: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The `status` integer on the wire does not map to a known [`Status`] variant.
    #[error("invalid frame status: {0}")]
    InvalidStatus(i32),
    /// The `interaction` integer on the wire does not map to a known [`Interaction`].
    #[error("invalid frame interaction: {0}")]
    InvalidInteraction(i32),
}

/// Lifecycle status of a frame in a request/response exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Initial request frame sent by the client.
    Request,
    /// Intermediate streaming item (non-terminal).
    Item,
    /// Successful terminal response.
    Done,
    /// Error terminal response.
    Error,
    /// Cancellation frame.
    Cancel,
}

impl Status {
    /// Terminal statuses end a response stream.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancel)
    }

    fn as_wire(self) -> WireStatus {
        match self {
            Self::Request => WireStatus::Request,
            Self::Item => WireStatus::Item,
            Self::Done => WireStatus::Done,
            Self::Error => WireStatus::Error,
            Self::Cancel => WireStatus::Cancel,
        }
    }

    fn from_i32(value: i32) -> Result<Self, CodecError> {
        match WireStatus::try_from(value) {
            Ok(WireStatus::Request) => Ok(Self::Request),
            Ok(WireStatus::Item) => Ok(Self::Item),
            Ok(WireStatus::Done) => Ok(Self::Done),
            Ok(WireStatus::Error) => Ok(Self::Error),
            Ok(WireStatus::Cancel) => Ok(Self::Cancel),
            Err(_) => Err(CodecError::InvalidStatus(value)),
        }
    }
}

/// Interaction model requested by a request frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interaction {
    /// Exactly one payload answers the request.
    #[default]
    RequestResponse,
    /// Zero or more `item` frames followed by `done`.
    RequestStream,
    /// No reply is expected.
    FireAndForget,
}

impl Interaction {
    fn as_wire(self) -> WireInteraction {
        match self {
            Self::RequestResponse => WireInteraction::RequestResponse,
            Self::RequestStream => WireInteraction::RequestStream,
            Self::FireAndForget => WireInteraction::FireAndForget,
        }
    }

    fn from_i32(value: i32) -> Result<Self, CodecError> {
        match WireInteraction::try_from(value) {
            Ok(WireInteraction::RequestResponse) => Ok(Self::RequestResponse),
            Ok(WireInteraction::RequestStream) => Ok(Self::RequestStream),
            Ok(WireInteraction::FireAndForget) => Ok(Self::FireAndForget),
            Err(_) => Err(CodecError::InvalidInteraction(value)),
        }
    }
}

/// A single message on the streaming wire protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Unique identifier for this frame (UUID string).
    pub id: String,
    /// ID of the request frame this is responding to, if any.
    pub parent_id: Option<String>,
    /// Milliseconds since the Unix epoch when the frame was created.
    pub ts: i64,
    /// Route metadata naming the backend operation, e.g. `"chats.getAll"`.
    pub route: String,
    /// Interaction model of the exchange this frame belongs to.
    pub interaction: Interaction,
    /// Lifecycle position of the frame.
    pub status: Status,
    /// Arbitrary JSON payload.
    pub data: Value,
}

impl Frame {
    /// Create a request frame with a fresh id.
    #[must_use]
    pub fn request(route: impl Into<String>, interaction: Interaction, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            ts: now_ms(),
            route: route.into(),
            interaction,
            status: Status::Request,
            data,
        }
    }

    /// Create a cancel frame targeting a previously submitted request.
    #[must_use]
    pub fn cancel(target: &Frame) -> Self {
        target.reply(Status::Cancel, Value::Null)
    }

    /// Create an item reply carrying one result.
    #[must_use]
    pub fn item(&self, data: Value) -> Self {
        self.reply(Status::Item, data)
    }

    /// Create a done reply, optionally carrying a final payload.
    #[must_use]
    pub fn done(&self, data: Value) -> Self {
        self.reply(Status::Done, data)
    }

    /// Create an error reply with a code and message.
    #[must_use]
    pub fn error(&self, code: &str, message: impl Into<String>) -> Self {
        let data = serde_json::json!({ "code": code, "message": message.into() });
        self.reply(Status::Error, data)
    }

    /// Error message carried by an error frame, if any.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.data.get("message").and_then(Value::as_str)
    }

    /// Error code carried by an error frame, if any.
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        self.data.get("code").and_then(Value::as_str)
    }

    fn reply(&self, status: Status, data: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: Some(self.id.clone()),
            ts: now_ms(),
            route: self.route.clone(),
            interaction: self.interaction,
            status,
            data,
        }
    }
}

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(duration.as_millis()).unwrap_or(0)
}

/// Encode a frame into protobuf bytes.
#[must_use]
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let wire = frame_to_wire(frame);

    let mut out = Vec::with_capacity(wire.encoded_len());
    // Encoding into a growable Vec cannot fail with `BufferTooSmall`.
    wire.encode(&mut out).unwrap_or_default();
    out
}

/// Decode protobuf bytes into a frame.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes and
/// [`CodecError::InvalidStatus`] / [`CodecError::InvalidInteraction`] for
/// out-of-range enum values.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    let wire = WireFrame::decode(bytes)?;
    wire_to_frame(wire)
}

fn frame_to_wire(frame: &Frame) -> WireFrame {
    WireFrame {
        id: frame.id.clone(),
        parent_id: frame.parent_id.clone(),
        ts: frame.ts,
        route: frame.route.clone(),
        interaction: frame.interaction.as_wire() as i32,
        status: frame.status.as_wire() as i32,
        data: Some(json_to_proto_value(&frame.data)),
    }
}

fn wire_to_frame(wire: WireFrame) -> Result<Frame, CodecError> {
    Ok(Frame {
        id: wire.id,
        parent_id: wire.parent_id,
        ts: wire.ts,
        route: wire.route,
        interaction: Interaction::from_i32(wire.interaction)?,
        status: Status::from_i32(wire.status)?,
        data: wire
            .data
            .map_or(Value::Object(Map::new()), |v| proto_to_json_value(&v)),
    })
}

fn json_to_proto_value(value: &Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => {
            prost_types::value::Kind::NullValue(prost_types::NullValue::NullValue as i32)
        }
        Value::Bool(v) => prost_types::value::Kind::BoolValue(*v),
        Value::Number(v) => prost_types::value::Kind::NumberValue(v.as_f64().unwrap_or(0.0)),
        Value::String(v) => prost_types::value::Kind::StringValue(v.clone()),
        Value::Array(v) => prost_types::value::Kind::ListValue(prost_types::ListValue {
            values: v.iter().map(json_to_proto_value).collect(),
        }),
        Value::Object(v) => prost_types::value::Kind::StructValue(prost_types::Struct {
            fields: v
                .iter()
                .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
                .collect(),
        }),
    };

    prost_types::Value { kind: Some(kind) }
}

fn proto_to_json_value(value: &prost_types::Value) -> Value {
    let Some(kind) = &value.kind else {
        return Value::Null;
    };

    match kind {
        prost_types::value::Kind::NullValue(_) => Value::Null,
        prost_types::value::Kind::NumberValue(v) => number_to_json(*v),
        prost_types::value::Kind::StringValue(v) => Value::String(v.clone()),
        prost_types::value::Kind::BoolValue(v) => Value::Bool(*v),
        prost_types::value::Kind::StructValue(v) => Value::Object(
            v.fields
                .iter()
                .map(|(k, v)| (k.clone(), proto_to_json_value(v)))
                .collect(),
        ),
        prost_types::value::Kind::ListValue(v) => {
            Value::Array(v.values.iter().map(proto_to_json_value).collect())
        }
    }
}

/// Protobuf carries every number as `f64`; integral values come back as
/// JSON integers so typed payloads (`page`, `count`) deserialize cleanly.
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn number_to_json(v: f64) -> Value {
    const MAX_SAFE_INT: f64 = 9_007_199_254_740_991.0;
    if v.fract() == 0.0 && v.abs() <= MAX_SAFE_INT {
        return Value::from(v as i64);
    }
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

#[derive(Clone, PartialEq, Message)]
struct WireFrame {
    #[prost(string, tag = "1")]
    id: String,
    #[prost(string, optional, tag = "2")]
    parent_id: Option<String>,
    #[prost(int64, tag = "3")]
    ts: i64,
    #[prost(string, tag = "4")]
    route: String,
    #[prost(enumeration = "WireInteraction", tag = "5")]
    interaction: i32,
    #[prost(enumeration = "WireStatus", tag = "6")]
    status: i32,
    #[prost(message, optional, tag = "7")]
    data: Option<prost_types::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireStatus {
    Request = 0,
    Done = 1,
    Error = 2,
    Cancel = 3,
    Item = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
enum WireInteraction {
    RequestResponse = 0,
    RequestStream = 1,
    FireAndForget = 2,
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
