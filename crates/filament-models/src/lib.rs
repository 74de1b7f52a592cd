pub mod gateway;
pub mod presence;
pub mod voice;

pub use gateway::{ClientOp, GatewayEvent};
pub use presence::PresenceStatus;
pub use voice::{ConsumerParams, ProducerType, RemoteProducer, TransportParams};

/// Snowflake-style identifier for users, servers and channels.
pub type Id = i64;
