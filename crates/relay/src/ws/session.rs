// One accepted WebSocket connection, from credential check to close.
//
// The socket is split: this task owns the read half and runs the receive
// loop, while a writer task owns the sink and drains the connection's
// outbound queue. The registry only ever sees the queue sender.

use std::{sync::Arc, time::Duration};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use courier_common::{
    protocol::ws::{
        encode_event, EnvelopeError, ServerEvent, CLOSE_INTERNAL_ERROR, CLOSE_POLICY_VIOLATION,
    },
    types::UserId,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::SendTimeoutError},
        oneshot,
    },
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tracing::{error, info, warn};

use super::{
    registry::{ConnectionHandle, ConnectionRegistry},
    relay::{relay_frame, timestamp, ServerMessageIds},
};
use crate::{
    auth::{IdentityError, IdentityVerifier},
    config::{RelayConfig, DEFAULT_MAX_FRAME_BYTES, DEFAULT_OUTBOUND_QUEUE, DEFAULT_SEND_TIMEOUT_MS},
    metrics, request_id,
};

pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub outbound_queue: usize,
    pub max_frame_bytes: usize,
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            send_timeout: Duration::from_millis(DEFAULT_SEND_TIMEOUT_MS),
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(HEARTBEAT_TIMEOUT_MS),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            outbound_queue: config.outbound_queue,
            max_frame_bytes: config.max_frame_bytes,
            send_timeout: config.send_timeout,
            ..Self::default()
        }
    }
}

/// Why an authenticated session ended other than by an orderly peer close.
#[derive(Debug, Error)]
pub enum SessionFault {
    #[error("undecodable frame: {0}")]
    Decode(#[source] EnvelopeError),
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
    #[error("frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },
    #[error("transport error: {0}")]
    Transport(#[source] axum::Error),
    #[error("no frame from peer within {0:?}")]
    HeartbeatTimeout(Duration),
    #[error("evicted after a failed delivery")]
    Evicted,
    #[error("outbound queue closed")]
    OutboundClosed,
    #[error("outbound queue stalled")]
    OutboundStalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthRejection {
    MissingToken,
    Rejected(IdentityError),
}

impl AuthRejection {
    fn reason(self) -> &'static str {
        match self {
            Self::MissingToken => "missing token",
            Self::Rejected(IdentityError::Invalid) => "invalid token",
            Self::Rejected(IdentityError::Expired) => "token expired",
        }
    }
}

fn authenticate(
    verifier: &dyn IdentityVerifier,
    credential: Option<&str>,
) -> Result<UserId, AuthRejection> {
    let credential = credential.ok_or(AuthRejection::MissingToken)?;
    verifier.verify(credential).map_err(AuthRejection::Rejected)
}

pub(crate) fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.to_owned().into() }))
}

pub async fn run_session(
    registry: Arc<ConnectionRegistry>,
    verifier: Arc<dyn IdentityVerifier>,
    settings: SessionSettings,
    credential: Option<String>,
    mut socket: WebSocket,
) {
    let request_id = request_id::current().unwrap_or_else(|| "unknown".to_string());

    let user_id = match authenticate(verifier.as_ref(), credential.as_deref()) {
        Ok(user_id) => user_id,
        Err(rejection) => {
            metrics::increment_auth_failures();
            info!(request_id = %request_id, reason = rejection.reason(), "rejecting websocket session");
            let _ = socket.send(close_frame(CLOSE_POLICY_VIOLATION, rejection.reason())).await;
            return;
        }
    };

    let (outbound, outbound_receiver) = mpsc::channel(settings.outbound_queue.max(1));
    let handle = ConnectionHandle::new(outbound.clone());
    let connection_id = handle.id();

    // Queued before registration so nothing relayed can overtake it.
    let connected = ServerEvent::Connected { user_id, online_at: timestamp(Utc::now()) };
    if outbound.try_send(connected).is_err() {
        error!(user_id = %user_id, request_id = %request_id, "failed to queue connected event");
        let _ = socket.send(close_frame(CLOSE_INTERNAL_ERROR, "internal error")).await;
        return;
    }

    registry.register(user_id, handle.clone());
    metrics::increment_connections_opened();
    info!(
        user_id = %user_id,
        connection_id = %connection_id,
        request_id = %request_id,
        "session active"
    );

    let (sink, stream) = socket.split();
    let (close_sender, close_receiver) = oneshot::channel();
    let mut writer = tokio::spawn(write_loop(
        sink,
        outbound_receiver,
        close_receiver,
        settings.heartbeat_interval,
    ));

    let mut ids = ServerMessageIds::new(user_id);
    let outcome = receive_loop(&registry, &handle, &outbound, stream, &mut ids, &settings).await;

    registry.deregister(user_id, connection_id);

    let close = match &outcome {
        Ok(()) => None,
        Err(_) => Some(CloseFrame {
            code: CLOSE_INTERNAL_ERROR,
            reason: "internal error".to_owned().into(),
        }),
    };
    let _ = close_sender.send(close);
    if timeout(settings.send_timeout, &mut writer).await.is_err() {
        writer.abort();
    }

    metrics::increment_connections_closed(outcome.is_err());
    match outcome {
        Ok(()) => info!(
            user_id = %user_id,
            connection_id = %connection_id,
            request_id = %request_id,
            "session closed by peer"
        ),
        Err(fault) => warn!(
            user_id = %user_id,
            connection_id = %connection_id,
            request_id = %request_id,
            error = %fault,
            "session closed on fault"
        ),
    }
}

async fn receive_loop(
    registry: &ConnectionRegistry,
    handle: &ConnectionHandle,
    outbound: &mpsc::Sender<ServerEvent>,
    mut stream: SplitStream<WebSocket>,
    ids: &mut ServerMessageIds,
    settings: &SessionSettings,
) -> Result<(), SessionFault> {
    let mut heartbeat = interval_at(
        Instant::now() + settings.heartbeat_interval,
        settings.heartbeat_interval,
    );
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let liveness_window = settings.heartbeat_interval + settings.heartbeat_timeout;
    let mut last_seen = Instant::now();

    loop {
        let frame = tokio::select! {
            _ = handle.evicted() => return Err(SessionFault::Evicted),
            _ = outbound.closed() => return Err(SessionFault::OutboundClosed),
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > liveness_window {
                    return Err(SessionFault::HeartbeatTimeout(liveness_window));
                }
                continue;
            }
            frame = stream.next() => frame,
        };

        let message = match frame {
            None => return Ok(()),
            Some(Ok(message)) => message,
            Some(Err(error)) if is_frame_size_violation(&error) => {
                return Err(SessionFault::FrameTooLarge { limit: settings.max_frame_bytes });
            }
            Some(Err(error)) => return Err(SessionFault::Transport(error)),
        };
        last_seen = Instant::now();

        let raw = match &message {
            Message::Text(text) => text.as_str(),
            Message::Binary(bytes) => {
                std::str::from_utf8(bytes).map_err(|_| SessionFault::NotUtf8)?
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Ok(()),
        };

        let reply = relay_frame(registry, ids, raw).await.map_err(SessionFault::Decode)?;
        match outbound.send_timeout(reply, settings.send_timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Closed(_)) => return Err(SessionFault::OutboundClosed),
            Err(SendTimeoutError::Timeout(_)) => return Err(SessionFault::OutboundStalled),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerEvent>,
    mut close: oneshot::Receiver<Option<CloseFrame>>,
    heartbeat_interval: Duration,
) {
    let mut ping = interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            instruction = &mut close => {
                if let Ok(Some(frame)) = instruction {
                    let _ = sink.send(Message::Close(Some(frame))).await;
                }
                break;
            }
            event = outbound.recv() => {
                let Some(event) = event else {
                    break;
                };
                let encoded = match encode_event(&event) {
                    Ok(encoded) => encoded,
                    Err(error) => {
                        error!(error = %error, event = event.name(), "failed to encode server event");
                        continue;
                    }
                };
                if sink.send(Message::Text(encoded.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::{authenticate, AuthRejection, SessionSettings, HEARTBEAT_INTERVAL_MS};
    use crate::auth::{IdentityError, IdentityVerifier};
    use courier_common::types::UserId;
    use std::time::Duration;

    struct StaticVerifier;

    impl IdentityVerifier for StaticVerifier {
        fn verify(&self, credential: &str) -> Result<UserId, IdentityError> {
            match credential {
                "good" => Ok(UserId(11)),
                "old" => Err(IdentityError::Expired),
                _ => Err(IdentityError::Invalid),
            }
        }
    }

    #[test]
    fn authenticate_maps_each_rejection_to_a_close_reason() {
        assert_eq!(authenticate(&StaticVerifier, Some("good")), Ok(UserId(11)));

        let missing = authenticate(&StaticVerifier, None).expect_err("no credential");
        assert_eq!(missing, AuthRejection::MissingToken);
        assert_eq!(missing.reason(), "missing token");

        let invalid = authenticate(&StaticVerifier, Some("forged")).expect_err("bad credential");
        assert_eq!(invalid.reason(), "invalid token");

        let expired = authenticate(&StaticVerifier, Some("old")).expect_err("stale credential");
        assert_eq!(expired.reason(), "token expired");
    }

    #[test]
    fn default_settings_use_protocol_heartbeat() {
        let settings = SessionSettings::default();
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(HEARTBEAT_INTERVAL_MS));
        assert!(settings.heartbeat_timeout < settings.heartbeat_interval);
        assert!(settings.outbound_queue > 0);
    }
}
