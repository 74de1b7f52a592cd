use std::sync::Arc;

use dashmap::DashSet;
use filament_models::{GatewayEvent, Id};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};

use crate::broker::{Broker, BrokerMessage};
use crate::error::CoreError;
use crate::registry::{ConnectionRegistry, Frame};

fn server_channel(server_id: Id) -> String {
    format!("server:{server_id}")
}

fn user_channel(user_id: Id) -> String {
    format!("user:{user_id}")
}

/// Envelope carried on broker channels: the event plus the excluded-user
/// marker, so every receiving process applies the same exclusion locally.
#[derive(Debug, Serialize, Deserialize)]
struct FanoutEnvelope {
    event: GatewayEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exclude_user: Option<Id>,
}

/// Cross-process publish/subscribe bridge. Publishing goes out through the
/// broker; this process receives its own messages back on the dispatch loop
/// like any other, so local and remote delivery share one path.
pub struct FanoutAdapter {
    broker: Arc<dyn Broker>,
    registry: Arc<ConnectionRegistry>,
    /// Broker channels this process currently holds.
    channels: DashSet<String>,
    /// Receiver claimed by [`FanoutAdapter::run`]. Created here, before any
    /// publish can happen, so messages sent while the dispatch task is still
    /// waiting for its first poll are buffered instead of dropped.
    inbox: Mutex<Option<broadcast::Receiver<BrokerMessage>>>,
}

impl FanoutAdapter {
    pub fn new(broker: Arc<dyn Broker>, registry: Arc<ConnectionRegistry>) -> Arc<Self> {
        let inbox = Mutex::new(Some(broker.messages()));
        Arc::new(Self {
            broker,
            registry,
            channels: DashSet::new(),
            inbox,
        })
    }

    pub async fn publish_to_server(
        &self,
        server_id: Id,
        event: GatewayEvent,
        exclude_user: Option<Id>,
    ) -> Result<(), CoreError> {
        let payload = serde_json::to_string(&FanoutEnvelope {
            event,
            exclude_user,
        })
        .map_err(|e| CoreError::Malformed(e.to_string()))?;
        self.broker.publish(&server_channel(server_id), payload).await
    }

    pub async fn publish_to_user(&self, user_id: Id, event: GatewayEvent) -> Result<(), CoreError> {
        let payload = serde_json::to_string(&FanoutEnvelope {
            event,
            exclude_user: None,
        })
        .map_err(|e| CoreError::Malformed(e.to_string()))?;
        self.broker.publish(&user_channel(user_id), payload).await
    }

    pub async fn subscribe_server(&self, server_id: Id) -> Result<(), CoreError> {
        let channel = server_channel(server_id);
        if self.channels.insert(channel.clone()) {
            self.broker.subscribe(&channel).await?;
        }
        Ok(())
    }

    /// No-op unless the registry confirms zero local subscribers remain.
    /// Over-subscription is harmless (extra traffic, not missed events), so
    /// this is best-effort.
    pub async fn unsubscribe_server(&self, server_id: Id) -> Result<(), CoreError> {
        if self.registry.has_local_subscribers(server_id) {
            return Ok(());
        }
        let channel = server_channel(server_id);
        if self.channels.remove(&channel).is_some() {
            self.broker.unsubscribe(&channel).await?;
        }
        Ok(())
    }

    pub async fn subscribe_user(&self, user_id: Id) -> Result<(), CoreError> {
        let channel = user_channel(user_id);
        if self.channels.insert(channel.clone()) {
            self.broker.subscribe(&channel).await?;
        }
        Ok(())
    }

    pub async fn unsubscribe_user(&self, user_id: Id) -> Result<(), CoreError> {
        if self.registry.connection_count(user_id) > 0 {
            return Ok(());
        }
        let channel = user_channel(user_id);
        if self.channels.remove(&channel).is_some() {
            self.broker.unsubscribe(&channel).await?;
        }
        Ok(())
    }

    /// Run the inbound dispatch loop until the broker stream closes.
    /// Malformed messages are dropped with a debug log; nothing in here may
    /// crash the loop.
    pub async fn run(self: Arc<Self>) {
        let Some(mut rx) = self.inbox.lock().await.take() else {
            tracing::warn!("fanout dispatch loop is already running");
            return;
        };
        loop {
            let msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "fanout dispatch loop lagged");
                    continue;
                }
                Err(RecvError::Closed) => {
                    tracing::info!("broker message stream closed, fanout loop exiting");
                    return;
                }
            };
            self.dispatch(msg.channel.as_str(), msg.payload.as_str());
        }
    }

    fn dispatch(&self, channel: &str, payload: &str) {
        let envelope: FanoutEnvelope = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(channel, "dropping malformed broker message: {err}");
                return;
            }
        };
        let frame: Frame = match serde_json::to_string(&envelope.event) {
            Ok(json) => Arc::from(json.as_str()),
            Err(err) => {
                tracing::debug!(channel, "failed to re-serialize event: {err}");
                return;
            }
        };
        if let Some(raw) = channel.strip_prefix("server:") {
            match raw.parse::<Id>() {
                Ok(server_id) => {
                    self.registry
                        .broadcast_to_server(server_id, &frame, envelope.exclude_user)
                }
                Err(_) => tracing::debug!(channel, "unparseable server channel"),
            }
        } else if let Some(raw) = channel.strip_prefix("user:") {
            match raw.parse::<Id>() {
                Ok(user_id) => self.registry.send_to_user(user_id, &frame),
                Err(_) => tracing::debug!(channel, "unparseable user channel"),
            }
        } else {
            tracing::debug!(channel, "message on unrecognized channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, MemoryBrokerHub};
    use filament_models::PresenceStatus;
    use tokio::sync::mpsc;

    struct Process {
        registry: Arc<ConnectionRegistry>,
        fanout: Arc<FanoutAdapter>,
    }

    fn spawn_process(hub: &Arc<MemoryBrokerHub>) -> Process {
        let registry = Arc::new(ConnectionRegistry::new());
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::connect(hub));
        let fanout = FanoutAdapter::new(broker, registry.clone());
        tokio::spawn(fanout.clone().run());
        Process { registry, fanout }
    }

    async fn drain(rx: &mut mpsc::Receiver<Frame>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(frame) =
            tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await
        {
            match frame {
                Some(frame) => out.push(frame.to_string()),
                None => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn exclusion_holds_across_processes() {
        let hub = MemoryBrokerHub::new();
        let p1 = spawn_process(&hub);
        let p2 = spawn_process(&hub);

        // User 1 and 2 on process 1, user 3 on process 2, all in server 10.
        let (c1, mut rx1) = p1.registry.register(1);
        let (c2, mut rx2) = p1.registry.register(2);
        let (c3, mut rx3) = p2.registry.register(3);
        p1.registry.subscribe(c1, 10);
        p1.registry.subscribe(c2, 10);
        p2.registry.subscribe(c3, 10);
        p1.fanout.subscribe_server(10).await.unwrap();
        p2.fanout.subscribe_server(10).await.unwrap();

        p1.fanout
            .publish_to_server(
                10,
                GatewayEvent::PresenceUpdate {
                    user_id: 1,
                    status: PresenceStatus::Online,
                },
                Some(1),
            )
            .await
            .unwrap();

        assert!(drain(&mut rx1).await.is_empty(), "excluded user got event");
        assert_eq!(drain(&mut rx2).await.len(), 1);
        assert_eq!(drain(&mut rx3).await.len(), 1, "remote process missed event");
    }

    #[tokio::test]
    async fn publish_to_user_reaches_every_process() {
        let hub = MemoryBrokerHub::new();
        let p1 = spawn_process(&hub);
        let p2 = spawn_process(&hub);

        let (_c1, mut rx1) = p1.registry.register(9);
        let (_c2, mut rx2) = p2.registry.register(9);
        p1.fanout.subscribe_user(9).await.unwrap();
        p2.fanout.subscribe_user(9).await.unwrap();

        p1.fanout
            .publish_to_user(9, GatewayEvent::HeartbeatAck)
            .await
            .unwrap();

        assert_eq!(drain(&mut rx1).await.len(), 1);
        assert_eq!(drain(&mut rx2).await.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_is_gated_on_local_subscribers() {
        let hub = MemoryBrokerHub::new();
        let p = spawn_process(&hub);

        let (c1, _rx1) = p.registry.register(1);
        let (c2, mut rx2) = p.registry.register(2);
        p.registry.subscribe(c1, 10);
        p.registry.subscribe(c2, 10);
        p.fanout.subscribe_server(10).await.unwrap();

        // c1 goes away; c2 still subscribes locally, so the broker channel
        // must stay open.
        p.registry.remove(c1);
        p.fanout.unsubscribe_server(10).await.unwrap();

        p.fanout
            .publish_to_server(10, GatewayEvent::HeartbeatAck, None)
            .await
            .unwrap();
        assert_eq!(drain(&mut rx2).await.len(), 1);
    }

    #[tokio::test]
    async fn events_published_before_dispatch_starts_are_delivered() {
        let hub = MemoryBrokerHub::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::connect(&hub));
        let fanout = FanoutAdapter::new(broker, registry.clone());

        let (c, mut rx) = registry.register(1);
        registry.subscribe(c, 10);
        fanout.subscribe_server(10).await.unwrap();
        fanout
            .publish_to_server(10, GatewayEvent::HeartbeatAck, None)
            .await
            .unwrap();

        // The dispatch task only starts after the publish above. The event
        // must still arrive.
        tokio::spawn(fanout.clone().run());
        assert_eq!(drain(&mut rx).await.len(), 1);
    }

    #[tokio::test]
    async fn malformed_broker_messages_are_dropped() {
        let hub = MemoryBrokerHub::new();
        let p = spawn_process(&hub);
        let publisher = MemoryBroker::connect(&hub);

        let (c, mut rx) = p.registry.register(1);
        p.registry.subscribe(c, 10);
        p.fanout.subscribe_server(10).await.unwrap();

        publisher
            .publish("server:10", "{not json".into())
            .await
            .unwrap();
        publisher
            .publish("server:notanid", "{}".into())
            .await
            .unwrap();
        assert!(drain(&mut rx).await.is_empty());

        // The dispatch loop must survive the garbage.
        p.fanout
            .publish_to_server(10, GatewayEvent::HeartbeatAck, None)
            .await
            .unwrap();
        assert_eq!(drain(&mut rx).await.len(), 1);
    }
}
