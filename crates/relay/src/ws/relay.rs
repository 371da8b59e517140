use chrono::{DateTime, SecondsFormat, Utc};
use courier_common::{
    protocol::ws::{parse_envelope, EnvelopeError, RelayedMessage, ServerEvent},
    types::UserId,
};
use tracing::{debug, warn};

use super::registry::ConnectionRegistry;
use crate::metrics;

/// Per-session source of server message ids.
///
/// Ids look like `{sender}-{unix_micros}-{seq}`. The sequence is local to the
/// session, so two envelopes from the same connection in the same microsecond
/// still differ and no counter is shared across connections.
#[derive(Debug)]
pub struct ServerMessageIds {
    sender: UserId,
    next_seq: u64,
}

impl ServerMessageIds {
    pub fn new(sender: UserId) -> Self {
        Self { sender, next_seq: 0 }
    }

    pub fn sender(&self) -> UserId {
        self.sender
    }

    fn next(&mut self, now: DateTime<Utc>) -> String {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        format!("{}-{}-{seq}", self.sender, now.timestamp_micros())
    }
}

pub(crate) fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Handle one inbound frame from the sender owning `ids`.
///
/// Returns the reply for the originating connection: an `ack` for a valid
/// envelope or an `error` event for a malformed one. `Err` is returned only
/// for frames that cannot be decoded at all, which end the session.
pub async fn relay_frame(
    registry: &ConnectionRegistry,
    ids: &mut ServerMessageIds,
    raw: &str,
) -> Result<ServerEvent, EnvelopeError> {
    let envelope = match parse_envelope(raw) {
        Ok(envelope) => envelope,
        Err(error) if error.is_fatal() => return Err(error),
        Err(error) => {
            metrics::increment_malformed_envelopes();
            warn!(user_id = %ids.sender(), error = %error, "rejecting malformed envelope");
            return Ok(ServerEvent::Error { error: error.to_string() });
        }
    };

    let now = Utc::now();
    let server_msg_id = ids.next(now);
    let client_msg_id = envelope.client_msg_id.clone();
    let recipient = envelope.to;

    // Delivery is decided here. Connections that fail during the broadcast
    // below do not change the ack.
    let delivered = registry.is_online(recipient);
    if delivered {
        let message = RelayedMessage {
            from: ids.sender(),
            to: recipient,
            kind: envelope.kind,
            content: envelope.content,
            file_url: envelope.file_url,
            client_msg_id: envelope.client_msg_id,
            server_msg_id: server_msg_id.clone(),
            timestamp: timestamp(now),
        };
        registry.broadcast_to_user(recipient, ServerEvent::Message(message)).await;
    }

    metrics::record_relay_outcome(delivered);
    debug!(
        user_id = %ids.sender(),
        to = %recipient,
        server_msg_id = %server_msg_id,
        delivered,
        "envelope relayed"
    );

    Ok(ServerEvent::Ack { client_msg_id, server_msg_id, delivered })
}
