use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::presence::PresenceStatus;
use crate::voice::{ConsumerParams, ProducerType, RemoteProducer, TransportParams};
use crate::Id;

/// Every event the gateway pushes to clients. Wire shape is
/// `{"op": "<EVENT_NAME>", "d": {...}}`; the enum is closed so the
/// dispatcher gets compile-time exhaustiveness instead of string-keyed maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayEvent {
    Hello {
        heartbeat_interval: u64,
    },
    HeartbeatAck,
    Ready {
        user_id: Id,
        session_id: String,
    },
    PresenceUpdate {
        user_id: Id,
        status: PresenceStatus,
    },
    TypingStart {
        channel_id: Id,
        user_id: Id,
        username: String,
        timestamp: i64,
    },
    /// Ack for a voice join: connection parameters plus the producers that
    /// already exist in the room, so the client can consume them right away.
    VoiceJoined {
        channel_id: Id,
        send_transport: TransportParams,
        recv_transport: TransportParams,
        existing_producers: Vec<RemoteProducer>,
    },
    TransportConnected {
        transport_id: String,
    },
    ProducerCreated {
        producer_id: String,
        producer_type: ProducerType,
    },
    ConsumerCreated {
        channel_id: Id,
        consumer: ConsumerParams,
    },
    /// Another participant started producing; consume it if interested.
    ProducerAvailable {
        channel_id: Id,
        user_id: Id,
        producer_id: String,
        producer_type: ProducerType,
    },
    /// A producer went away (closed or its owner left); tear down consumers.
    ProducerClosed {
        channel_id: Id,
        user_id: Id,
        producer_id: String,
    },
    VoiceStateUpdate {
        channel_id: Id,
        user_id: Id,
        self_mute: bool,
        self_deaf: bool,
    },
    VoiceLeft {
        channel_id: Id,
        user_id: Id,
    },
    /// The room's media worker died; the participant has been evicted.
    VoiceForcedLeave {
        channel_id: Id,
        reason: String,
    },
    /// Typed rejection for a client-initiated operation.
    OpError {
        code: ErrorCode,
        message: String,
    },
}

/// Error codes surfaced to the client, mirroring the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyJoined,
    AlreadyExists,
    Unavailable,
    Malformed,
}

/// Every operation a client may send. Same adjacently-tagged wire shape as
/// [`GatewayEvent`]; unknown ops fail deserialization and are rejected as
/// malformed rather than crashing the session loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "d", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientOp {
    Identify {
        token: String,
    },
    Heartbeat,
    SubscribeServer {
        server_id: Id,
    },
    UnsubscribeServer {
        server_id: Id,
    },
    PresenceUpdate {
        status: PresenceStatus,
    },
    TypingStart {
        channel_id: Id,
    },
    VoiceJoin {
        channel_id: Id,
    },
    VoiceConnectTransport {
        channel_id: Id,
        transport_id: String,
        dtls_parameters: Value,
    },
    VoiceProduce {
        channel_id: Id,
        transport_id: String,
        producer_type: ProducerType,
        rtp_parameters: Value,
    },
    VoiceConsume {
        channel_id: Id,
        producer_id: String,
        rtp_capabilities: Value,
    },
    VoiceStopScreenShare {
        channel_id: Id,
    },
    VoiceStateUpdate {
        channel_id: Id,
        self_mute: bool,
        self_deaf: bool,
    },
    VoiceLeave {
        channel_id: Id,
    },
}
