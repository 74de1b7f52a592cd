use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::error::CoreError;

/// One message received from a broker channel this process subscribes to.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

/// The three broker primitives the core consumes: pub/sub fanout, channel
/// subscription management, and TTL key-value storage for ephemeral records.
/// Implementations must never let a broker failure escape as a panic; every
/// error is surfaced as [`CoreError::Broker`] and contained by the caller.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), CoreError>;
    async fn subscribe(&self, channel: &str) -> Result<(), CoreError>;
    async fn unsubscribe(&self, channel: &str) -> Result<(), CoreError>;
    /// Stream of inbound messages for every subscribed channel. Receivers
    /// that lag are dropped by `broadcast` semantics; the dispatch loop
    /// logs and resumes rather than crashing.
    fn messages(&self) -> broadcast::Receiver<BrokerMessage>;

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), CoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, CoreError>;
    async fn del(&self, key: &str) -> Result<(), CoreError>;
}

const HUB_CHANNEL_CAPACITY: usize = 1024;

struct HubClient {
    subscriptions: tokio::sync::Mutex<HashSet<String>>,
    tx: broadcast::Sender<BrokerMessage>,
}

/// In-process broker shared by every [`MemoryBroker`] connected to it.
/// Stands in for the external pub/sub service: each connected broker acts
/// as one process, so tests can run several "processes" against one hub.
pub struct MemoryBrokerHub {
    next_client: AtomicU64,
    clients: DashMap<u64, Arc<HubClient>>,
    kv: DashMap<String, (String, Instant)>,
}

impl MemoryBrokerHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_client: AtomicU64::new(0),
            clients: DashMap::new(),
            kv: DashMap::new(),
        })
    }

    async fn publish(&self, channel: &str, payload: &str) {
        for client in self.clients.iter() {
            let subscribed = client.subscriptions.lock().await.contains(channel);
            if subscribed {
                let _ = client.tx.send(BrokerMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                });
            }
        }
    }
}

/// One process's connection to a [`MemoryBrokerHub`].
pub struct MemoryBroker {
    hub: Arc<MemoryBrokerHub>,
    client: Arc<HubClient>,
}

impl MemoryBroker {
    pub fn connect(hub: &Arc<MemoryBrokerHub>) -> Self {
        let (tx, _) = broadcast::channel(HUB_CHANNEL_CAPACITY);
        let client = Arc::new(HubClient {
            subscriptions: tokio::sync::Mutex::new(HashSet::new()),
            tx,
        });
        let id = hub.next_client.fetch_add(1, Ordering::Relaxed);
        hub.clients.insert(id, client.clone());
        Self {
            hub: hub.clone(),
            client,
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), CoreError> {
        self.hub.publish(channel, &payload).await;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), CoreError> {
        self.client
            .subscriptions
            .lock()
            .await
            .insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), CoreError> {
        self.client.subscriptions.lock().await.remove(channel);
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<BrokerMessage> {
        self.client.tx.subscribe()
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), CoreError> {
        self.hub
            .kv
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        // Lazy expiry, matching how the external store's TTL behaves.
        if let Some(entry) = self.hub.kv.get(key) {
            if Instant::now() < entry.1 {
                return Ok(Some(entry.0.clone()));
            }
        }
        self.hub.kv.remove_if(key, |_, (_, exp)| Instant::now() >= *exp);
        Ok(None)
    }

    async fn del(&self, key: &str) -> Result<(), CoreError> {
        self.hub.kv.remove(key);
        Ok(())
    }
}
