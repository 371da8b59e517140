// WebSocket frame types for the courier chat relay.
//
// Clients send bare envelopes (no discriminant); the server answers with
// events that always carry `system` and `event` so clients can branch on
// the discriminant instead of the payload shape.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::{MessageKind, UserId};

/// Close code sent when the credential is missing or rejected.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code sent when the session dies on an unexpected fault.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

pub const INVALID_RECIPIENT_ERROR: &str = "Invalid 'to' user id";

/// Client -> Server: one message to relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub to: UserId,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    /// Opaque client token, echoed back verbatim in the relayed message and the ack.
    #[serde(default)]
    pub client_msg_id: Option<Value>,
}

/// Server -> Recipient: a relayed envelope stamped by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayedMessage {
    pub from: UserId,
    pub to: UserId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Option<String>,
    pub file_url: Option<String>,
    pub client_msg_id: Option<Value>,
    pub server_msg_id: String,
    pub timestamp: String,
}

/// Every frame the relay writes to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once after the credential has been verified and the connection registered.
    Connected { user_id: UserId, online_at: String },

    /// Sent when an inbound envelope is malformed. The session stays open.
    Error { error: String },

    /// A relayed message, delivered to every live connection of the recipient.
    Message(RelayedMessage),

    /// Sent to the originating connection for every valid envelope.
    Ack { client_msg_id: Option<Value>, server_msg_id: String, delivered: bool },
}

impl ServerEvent {
    /// Relayed messages are the only non-system events.
    pub fn is_system(&self) -> bool {
        !matches!(self, Self::Message(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Error { .. } => "error",
            Self::Message(_) => "message",
            Self::Ack { .. } => "ack",
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("frame is not valid JSON: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("Invalid 'to' user id")]
    InvalidRecipient,
    #[error("Invalid envelope: {0}")]
    InvalidField(#[source] serde_json::Error),
}

impl EnvelopeError {
    /// Undecodable frames end the session; shape errors are reported and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::NotAnObject)
    }
}

/// Parse one inbound frame into an envelope.
///
/// Fields are typed strictly rather than copied through as arbitrary JSON:
///
/// - `to` must be a JSON integer that fits in an `i64`. Strings, floats,
///   booleans and larger integers are an invalid recipient.
/// - `content`, `file_url` and `type` must be strings when present. Any other
///   JSON type is reported as an invalid field and the frame is not relayed.
/// - An explicit `"type": null` falls back to the default kind.
///
/// Both rejections are recoverable: the sender gets an `error` event and the
/// session continues.
pub fn parse_envelope(raw: &str) -> Result<InboundEnvelope, EnvelopeError> {
    let value = serde_json::from_str::<Value>(raw).map_err(EnvelopeError::Decode)?;
    let Value::Object(mut fields) = value else {
        return Err(EnvelopeError::NotAnObject);
    };

    if fields.get("to").and_then(Value::as_i64).is_none() {
        return Err(EnvelopeError::InvalidRecipient);
    }
    if fields.get("type").is_some_and(Value::is_null) {
        fields.remove("type");
    }

    serde_json::from_value::<InboundEnvelope>(Value::Object(fields))
        .map_err(EnvelopeError::InvalidField)
}

/// Serialize an event with its `system` discriminant.
pub fn encode_event(event: &ServerEvent) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(event)?;
    if let Value::Object(fields) = &mut value {
        fields.insert("system".to_string(), Value::Bool(event.is_system()));
    }
    serde_json::to_string(&value)
}

/// Decode a server event; the `system` flag is implied by the variant and ignored.
pub fn decode_event(raw: &str) -> Result<ServerEvent, serde_json::Error> {
    let mut fields = serde_json::from_str::<Map<String, Value>>(raw)?;
    fields.remove("system");
    serde_json::from_value(Value::Object(fields))
}
