use std::sync::Arc;
use std::time::Duration;

use filament_models::{GatewayEvent, Id};

use crate::broker::Broker;
use crate::error::CoreError;
use crate::fanout::FanoutAdapter;
use crate::membership::MembershipStore;

/// Clients resend typing signals every ~5s; one broadcast per 10s window is
/// enough for consumers, which infer "stopped typing" from expiry alone.
pub const DEFAULT_TYPING_TTL: Duration = Duration::from_secs(10);

fn typing_key(channel_id: Id, user_id: Id) -> String {
    format!("typing:{channel_id}:{user_id}")
}

/// Per-(channel, user) typing flag with TTL and broadcast throttling. A live
/// record means "already announced this window": the signal only refreshes
/// the TTL. No typing-stop event exists anywhere in the protocol.
pub struct TypingTracker {
    broker: Arc<dyn Broker>,
    fanout: Arc<FanoutAdapter>,
    membership: Arc<dyn MembershipStore>,
    ttl: Duration,
}

impl TypingTracker {
    pub fn new(
        broker: Arc<dyn Broker>,
        fanout: Arc<FanoutAdapter>,
        membership: Arc<dyn MembershipStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            broker,
            fanout,
            membership,
            ttl,
        }
    }

    pub async fn typing_started(&self, channel_id: Id, user_id: Id) -> Result<(), CoreError> {
        let key = typing_key(channel_id, user_id);
        let already_live = self.broker.get(&key).await?.is_some();
        self.broker.set_ex(&key, "1".to_string(), self.ttl).await?;
        if already_live {
            // Throttled: at most one broadcast per TTL window.
            return Ok(());
        }

        let server_id = self
            .membership
            .server_for_channel(channel_id)
            .await
            .ok_or(CoreError::NotFound("channel"))?;
        let username = self
            .membership
            .username(user_id)
            .await
            .unwrap_or_else(|| user_id.to_string());

        self.fanout
            .publish_to_server(
                server_id,
                GatewayEvent::TypingStart {
                    channel_id,
                    user_id,
                    username,
                    timestamp: chrono::Utc::now().timestamp(),
                },
                Some(user_id),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, MemoryBrokerHub};
    use crate::membership::StaticMembership;
    use crate::registry::{ConnectionRegistry, Frame};
    use tokio::sync::mpsc;

    async fn typing_starts(rx: &mut mpsc::Receiver<Frame>) -> usize {
        let mut count = 0;
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
        {
            if matches!(
                serde_json::from_str(&frame),
                Ok(GatewayEvent::TypingStart { .. })
            ) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn rebroadcast_is_throttled_to_one_per_window() {
        let hub = MemoryBrokerHub::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::connect(&hub));
        let fanout = FanoutAdapter::new(broker.clone(), registry.clone());
        tokio::spawn(fanout.clone().run());

        let membership = Arc::new(StaticMembership::new());
        membership.add_channel(100, 10);
        membership.add_user(1, "kira");
        let typing = TypingTracker::new(broker, fanout.clone(), membership, DEFAULT_TYPING_TTL);

        // Sender (user 1) and a listener (user 2), both in server 10.
        let (sender, mut sender_rx) = registry.register(1);
        let (listener, mut listener_rx) = registry.register(2);
        registry.subscribe(sender, 10);
        registry.subscribe(listener, 10);
        fanout.subscribe_server(10).await.unwrap();

        // Two signals inside the window: one broadcast.
        typing.typing_started(100, 1).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        typing.typing_started(100, 1).await.unwrap();
        assert_eq!(typing_starts(&mut listener_rx).await, 1);

        // Past the refreshed TTL: the next signal broadcasts again.
        tokio::time::advance(Duration::from_secs(11)).await;
        typing.typing_started(100, 1).await.unwrap();
        assert_eq!(typing_starts(&mut listener_rx).await, 1);

        // The sender is always excluded.
        assert_eq!(typing_starts(&mut sender_rx).await, 0);
    }

    #[tokio::test]
    async fn unknown_channel_is_a_typed_failure() {
        let hub = MemoryBrokerHub::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::connect(&hub));
        let fanout = FanoutAdapter::new(broker.clone(), registry);
        let typing = TypingTracker::new(
            broker,
            fanout,
            Arc::new(StaticMembership::new()),
            DEFAULT_TYPING_TTL,
        );

        assert!(matches!(
            typing.typing_started(404, 1).await,
            Err(CoreError::NotFound("channel"))
        ));
    }
}
