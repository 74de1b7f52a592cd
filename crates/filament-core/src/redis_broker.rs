use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc};

use crate::broker::{Broker, BrokerMessage};
use crate::error::CoreError;

const INBOUND_CAPACITY: usize = 4096;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

enum SubCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Redis-backed broker. Commands (publish, key-value) go over a multiplexed
/// [`ConnectionManager`], which is cheap to clone and reconnects on its own.
/// Pub/sub needs a dedicated connection, owned by a background task; losing
/// it must not crash the process, and broker-side subscriptions do not
/// survive a reconnect, so the task re-subscribes every channel still held
/// in `subscriptions` each time it reconnects.
pub struct RedisBroker {
    manager: ConnectionManager,
    subscriptions: Arc<DashSet<String>>,
    inbound: broadcast::Sender<BrokerMessage>,
    commands: mpsc::UnboundedSender<SubCommand>,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        // Never log the URL itself, it may embed credentials.
        let client = redis::Client::open(url)
            .map_err(|e| CoreError::Broker(format!("invalid broker url: {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CoreError::Broker(format!("broker connect failed: {e}")))?;

        let subscriptions: Arc<DashSet<String>> = Arc::new(DashSet::new());
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let (commands, command_rx) = mpsc::unbounded_channel();

        tokio::spawn(pubsub_task(
            client,
            subscriptions.clone(),
            inbound.clone(),
            command_rx,
        ));

        Ok(Self {
            manager,
            subscriptions,
            inbound,
            commands,
        })
    }
}

async fn pubsub_task(
    client: redis::Client,
    subscriptions: Arc<DashSet<String>>,
    inbound: broadcast::Sender<BrokerMessage>,
    mut command_rx: mpsc::UnboundedReceiver<SubCommand>,
) {
    loop {
        let pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(err) => {
                tracing::warn!("broker pub/sub connect failed, retrying: {err}");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let (mut sink, mut stream) = pubsub.split();

        // Broker-side subscriptions were lost with the old connection.
        let channels: Vec<String> = subscriptions.iter().map(|c| c.clone()).collect();
        for channel in &channels {
            if let Err(err) = sink.subscribe(channel).await {
                tracing::warn!(channel, "broker re-subscribe failed: {err}");
            }
        }
        if !channels.is_empty() {
            tracing::info!(count = channels.len(), "broker pub/sub re-subscribed");
        }

        loop {
            tokio::select! {
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        tracing::warn!("broker pub/sub stream closed, reconnecting");
                        break;
                    };
                    let channel = msg.get_channel_name().to_string();
                    match msg.get_payload::<String>() {
                        Ok(payload) => {
                            let _ = inbound.send(BrokerMessage { channel, payload });
                        }
                        Err(err) => {
                            tracing::debug!(channel, "dropping undecodable broker payload: {err}");
                        }
                    }
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(SubCommand::Subscribe(channel)) => {
                            if let Err(err) = sink.subscribe(&channel).await {
                                tracing::warn!(channel, "broker subscribe failed: {err}");
                            }
                        }
                        Some(SubCommand::Unsubscribe(channel)) => {
                            if let Err(err) = sink.unsubscribe(&channel).await {
                                tracing::warn!(channel, "broker unsubscribe failed: {err}");
                            }
                        }
                        // All senders gone: the broker was dropped.
                        None => return,
                    }
                }
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), CoreError> {
        let mut con = self.manager.clone();
        con.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(|e| CoreError::Broker(format!("publish failed: {e}")))
    }

    async fn subscribe(&self, channel: &str) -> Result<(), CoreError> {
        self.subscriptions.insert(channel.to_string());
        self.commands
            .send(SubCommand::Subscribe(channel.to_string()))
            .map_err(|_| CoreError::Broker("pub/sub task gone".into()))
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), CoreError> {
        self.subscriptions.remove(channel);
        self.commands
            .send(SubCommand::Unsubscribe(channel.to_string()))
            .map_err(|_| CoreError::Broker("pub/sub task gone".into()))
    }

    fn messages(&self) -> broadcast::Receiver<BrokerMessage> {
        self.inbound.subscribe()
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), CoreError> {
        let mut con = self.manager.clone();
        con.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| CoreError::Broker(format!("set_ex failed: {e}")))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        let mut con = self.manager.clone();
        con.get::<_, Option<String>>(key)
            .await
            .map_err(|e| CoreError::Broker(format!("get failed: {e}")))
    }

    async fn del(&self, key: &str) -> Result<(), CoreError> {
        let mut con = self.manager.clone();
        con.del::<_, ()>(key)
            .await
            .map_err(|e| CoreError::Broker(format!("del failed: {e}")))
    }
}
