pub mod auth;
pub mod broker;
pub mod error;
pub mod fanout;
pub mod membership;
pub mod presence;
pub mod redis_broker;
pub mod registry;
pub mod typing;

pub use auth::{Authenticator, StaticTokenAuth};
pub use broker::{Broker, BrokerMessage, MemoryBroker, MemoryBrokerHub};
pub use error::CoreError;
pub use fanout::FanoutAdapter;
pub use membership::{MembershipStore, StaticMembership};
pub use presence::{PresenceTracker, DEFAULT_PRESENCE_TTL};
pub use redis_broker::RedisBroker;
pub use registry::{ConnectionId, ConnectionRegistry, Frame};
pub use typing::{TypingTracker, DEFAULT_TYPING_TTL};
