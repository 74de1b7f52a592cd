use std::sync::Arc;
use std::time::Duration;

use filament_models::{GatewayEvent, Id, PresenceStatus};

use crate::broker::Broker;
use crate::error::CoreError;
use crate::fanout::FanoutAdapter;
use crate::membership::MembershipStore;
use crate::registry::{ConnectionId, ConnectionRegistry};

pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(90);

fn presence_key(user_id: Id) -> String {
    format!("presence:{user_id}")
}

/// Ephemeral per-user presence derived from the connection lifecycle plus
/// explicit status overrides. The record lives in the broker's TTL store and
/// is refreshed on every heartbeat; an unrefreshed record simply expires.
///
/// The offline transition checks the *local* registry only. A user with
/// connections spread over several processes can flicker when one process
/// drops its last connection; the explicit status-update protocol corrects
/// this on the surviving device. Known simplification, kept deliberately.
pub struct PresenceTracker {
    broker: Arc<dyn Broker>,
    fanout: Arc<FanoutAdapter>,
    registry: Arc<ConnectionRegistry>,
    membership: Arc<dyn MembershipStore>,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(
        broker: Arc<dyn Broker>,
        fanout: Arc<FanoutAdapter>,
        registry: Arc<ConnectionRegistry>,
        membership: Arc<dyn MembershipStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            broker,
            fanout,
            registry,
            membership,
            ttl,
        }
    }

    /// A connection for a user with no live presence record sets "online"
    /// and broadcasts; while a record exists, further connections only
    /// refresh the TTL. The record is the authority here, not the local
    /// connection count: the registry entry is created well before this
    /// call, so two near-simultaneous connects would each see the other's
    /// entry and neither would announce.
    pub async fn connection_opened(&self, user_id: Id) -> Result<(), CoreError> {
        if self.broker.get(&presence_key(user_id)).await?.is_some() {
            return self.refresh(user_id).await;
        }
        self.write_and_broadcast(user_id, PresenceStatus::Online)
            .await
    }

    /// Explicit client-requested status. Always rebroadcast, regardless of
    /// connection count, so multi-device status changes propagate.
    pub async fn set_status(&self, user_id: Id, status: PresenceStatus) -> Result<(), CoreError> {
        self.write_and_broadcast(user_id, status).await
    }

    /// Heartbeats keep the record alive.
    pub async fn heartbeat(&self, user_id: Id) -> Result<(), CoreError> {
        self.refresh(user_id).await
    }

    /// Called after the registry entry for `closing` has been removed. Only
    /// the process holding the user's last connection publishes offline, and
    /// it does so exactly once.
    pub async fn connection_closed(
        &self,
        user_id: Id,
        closing: ConnectionId,
    ) -> Result<(), CoreError> {
        if self.registry.has_other_connections(user_id, closing) {
            return Ok(());
        }
        self.broker.del(&presence_key(user_id)).await?;
        self.broadcast(user_id, PresenceStatus::Offline).await
    }

    async fn refresh(&self, user_id: Id) -> Result<(), CoreError> {
        let key = presence_key(user_id);
        let status = self
            .broker
            .get(&key)
            .await?
            .unwrap_or_else(|| PresenceStatus::Online.as_str().to_string());
        self.broker.set_ex(&key, status, self.ttl).await
    }

    async fn write_and_broadcast(
        &self,
        user_id: Id,
        status: PresenceStatus,
    ) -> Result<(), CoreError> {
        self.broker
            .set_ex(&presence_key(user_id), status.as_str().to_string(), self.ttl)
            .await?;
        self.broadcast(user_id, status).await
    }

    async fn broadcast(&self, user_id: Id, status: PresenceStatus) -> Result<(), CoreError> {
        for server_id in self.membership.server_ids_for_user(user_id).await {
            self.fanout
                .publish_to_server(server_id, GatewayEvent::PresenceUpdate { user_id, status }, None)
                .await?;
        }
        Ok(())
    }
}
