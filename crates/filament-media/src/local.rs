use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use filament_core::CoreError;
use filament_models::{ConsumerParams, ProducerType, TransportParams};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};

use crate::engine::{MediaEngine, MediaRouter, MediaWorker};

/// In-process media engine. Implements the full engine contract with
/// deterministic in-memory handles: useful for development runs without an
/// SFU deployment, and for exercising the orchestration layer in tests
/// (including worker-death injection via [`LocalMediaEngine::kill_worker`]).
#[derive(Default)]
pub struct LocalMediaEngine {
    workers: Mutex<Vec<Arc<LocalWorker>>>,
    routers_created: Arc<AtomicUsize>,
    transport_connects: Arc<AtomicUsize>,
}

impl LocalMediaEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Total routers created across all workers.
    pub fn routers_created(&self) -> usize {
        self.routers_created.load(Ordering::Relaxed)
    }

    /// Total transport-connect calls that actually reached the engine.
    pub fn transport_connects(&self) -> usize {
        self.transport_connects.load(Ordering::Relaxed)
    }

    /// Simulate an engine-process crash for the n-th created worker.
    pub async fn kill_worker(&self, index: usize) {
        let workers = self.workers.lock().await;
        if let Some(worker) = workers.get(index) {
            let _ = worker.died_tx.send(true);
        }
    }
}

#[async_trait]
impl MediaEngine for LocalMediaEngine {
    async fn create_worker(&self) -> Result<Arc<dyn MediaWorker>, CoreError> {
        let (died_tx, died_rx) = watch::channel(false);
        let worker = Arc::new(LocalWorker {
            died_tx,
            died_rx,
            routers_created: self.routers_created.clone(),
            transport_connects: self.transport_connects.clone(),
        });
        self.workers.lock().await.push(worker.clone());
        Ok(worker)
    }
}

pub struct LocalWorker {
    died_tx: watch::Sender<bool>,
    died_rx: watch::Receiver<bool>,
    routers_created: Arc<AtomicUsize>,
    transport_connects: Arc<AtomicUsize>,
}

#[async_trait]
impl MediaWorker for LocalWorker {
    async fn create_router(&self) -> Result<Arc<dyn MediaRouter>, CoreError> {
        self.routers_created.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(LocalRouter {
            transport_connects: self.transport_connects.clone(),
            ..LocalRouter::default()
        }))
    }

    fn died(&self) -> watch::Receiver<bool> {
        self.died_rx.clone()
    }

    async fn close(&self) {}
}

struct TransportState {
    connect_calls: AtomicUsize,
}

#[derive(Default)]
pub struct LocalRouter {
    transports: DashMap<String, TransportState>,
    producers: DashMap<String, ProducerType>,
    consumers: DashMap<String, String>,
    transport_connects: Arc<AtomicUsize>,
}

impl LocalRouter {
    fn placeholder_transport(id: String) -> TransportParams {
        TransportParams {
            id,
            ice_parameters: json!({"usernameFragment": "local", "password": "local"}),
            ice_candidates: json!([]),
            dtls_parameters: json!({"role": "auto", "fingerprints": []}),
        }
    }
}

#[async_trait]
impl MediaRouter for LocalRouter {
    async fn create_transport(&self) -> Result<TransportParams, CoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.transports.insert(
            id.clone(),
            TransportState {
                connect_calls: AtomicUsize::new(0),
            },
        );
        Ok(Self::placeholder_transport(id))
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        _dtls_parameters: Value,
    ) -> Result<(), CoreError> {
        let transport = self
            .transports
            .get(transport_id)
            .ok_or(CoreError::NotFound("transport"))?;
        transport.connect_calls.fetch_add(1, Ordering::Relaxed);
        self.transport_connects.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        producer_type: ProducerType,
        _rtp_parameters: Value,
    ) -> Result<String, CoreError> {
        if !self.transports.contains_key(transport_id) {
            return Err(CoreError::NotFound("transport"));
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.producers.insert(id.clone(), producer_type);
        Ok(id)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        _rtp_capabilities: Value,
    ) -> Result<ConsumerParams, CoreError> {
        if !self.transports.contains_key(transport_id) {
            return Err(CoreError::NotFound("transport"));
        }
        let producer_type = *self
            .producers
            .get(producer_id)
            .ok_or(CoreError::NotFound("producer"))?;
        let id = uuid::Uuid::new_v4().to_string();
        self.consumers.insert(id.clone(), producer_id.to_string());
        Ok(ConsumerParams {
            id,
            producer_id: producer_id.to_string(),
            producer_type,
            rtp_parameters: json!({"codecs": [], "encodings": []}),
        })
    }

    async fn close_producer(&self, producer_id: &str) {
        self.producers.remove(producer_id);
    }

    async fn close_consumer(&self, consumer_id: &str) {
        self.consumers.remove(consumer_id);
    }

    async fn close_transport(&self, transport_id: &str) {
        self.transports.remove(transport_id);
    }

    async fn close(&self) {
        self.transports.clear();
        self.producers.clear();
        self.consumers.clear();
    }
}
