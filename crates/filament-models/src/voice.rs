use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Id;

/// What a participant feeds into the room. Camera video and screen-share
/// video are distinct policy slots: a participant may run both at once, but
/// at most one of each (and at most one audio producer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerType {
    Audio,
    Camera,
    Screen,
}

impl ProducerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Camera => "camera",
            Self::Screen => "screen",
        }
    }
}

/// Connection parameters for one negotiated transport, handed to the client
/// as-is. The ICE/DTLS blobs come from the media engine and are opaque here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// Parameters for one consumer bound to the requesting participant's
/// receive transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerParams {
    pub id: String,
    pub producer_id: String,
    pub producer_type: ProducerType,
    pub rtp_parameters: Value,
}

/// A producer belonging to some other participant, advertised so the
/// receiving side can request to consume it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteProducer {
    pub user_id: Id,
    pub producer_id: String,
    pub producer_type: ProducerType,
}
