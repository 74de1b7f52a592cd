use filament_models::gateway::ErrorCode;
use thiserror::Error;

/// Error taxonomy for the gateway core. Every variant is recoverable and
/// scoped to the connection or room that triggered it; nothing here may
/// terminate the event loop or touch unrelated sessions.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Unknown connection, room, participant, transport or producer.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// A voice session already exists for this user in this room.
    #[error("already joined")]
    AlreadyJoined,
    /// A policy slot (audio / camera / screen) is already occupied.
    #[error("{0} producer already exists")]
    AlreadyExists(&'static str),
    /// No live workers remain in the pool; new rooms cannot be created.
    #[error("no media workers available")]
    Unavailable,
    /// A broker message or client payload failed shape validation.
    #[error("malformed payload: {0}")]
    Malformed(String),
    /// Broker command failure (publish, subscribe, key-value).
    #[error("broker error: {0}")]
    Broker(String),
    /// Media engine RPC failure.
    #[error("media engine error: {0}")]
    Engine(String),
}

impl CoreError {
    /// Wire-level error code for the typed rejection sent to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyJoined => ErrorCode::AlreadyJoined,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::Unavailable | Self::Broker(_) | Self::Engine(_) => ErrorCode::Unavailable,
            Self::Malformed(_) => ErrorCode::Malformed,
        }
    }
}
