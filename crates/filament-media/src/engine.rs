use std::sync::Arc;

use async_trait::async_trait;
use filament_core::CoreError;
use filament_models::{ConsumerParams, ProducerType, TransportParams};
use serde_json::Value;
use tokio::sync::watch;

/// The SFU engine seam. The orchestrator only sequences these calls and
/// holds the resulting opaque handles; codecs, ICE and DTLS never surface
/// past the `Value` blobs inside the parameter structs.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_worker(&self) -> Result<Arc<dyn MediaWorker>, CoreError>;
}

/// One engine process. Stateless from the orchestrator's view apart from
/// liveness.
#[async_trait]
pub trait MediaWorker: Send + Sync {
    async fn create_router(&self) -> Result<Arc<dyn MediaRouter>, CoreError>;
    /// Flips to `true` when the engine process backing this worker dies.
    fn died(&self) -> watch::Receiver<bool>;
    async fn close(&self);
}

/// Per-room media-routing context.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    async fn create_transport(&self) -> Result<TransportParams, CoreError>;
    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), CoreError>;
    /// Returns the new producer's id.
    async fn produce(
        &self,
        transport_id: &str,
        producer_type: ProducerType,
        rtp_parameters: Value,
    ) -> Result<String, CoreError>;
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> Result<ConsumerParams, CoreError>;
    async fn close_producer(&self, producer_id: &str);
    async fn close_consumer(&self, consumer_id: &str);
    async fn close_transport(&self, transport_id: &str);
    async fn close(&self);
}
