use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use filament_core::{ConnectionId, CoreError, FanoutAdapter};
use filament_models::Id;
use tokio::sync::OnceCell;

use crate::engine::{MediaEngine, MediaWorker};
use crate::room::{VoiceJoinInfo, VoiceRoom};

/// Recommended pool size: one worker per core, capped at four.
pub fn recommended_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(4)
}

struct WorkerSlot {
    worker: Arc<dyn MediaWorker>,
    alive: Arc<AtomicBool>,
}

/// Owns a fixed arena of media-engine workers and load-balances room
/// creation across them with round-robin. A worker that dies is marked dead
/// in place and skipped from then on; it is never restarted within the
/// process lifetime (fail-stop), and every room assigned to it is evicted
/// with a forced-leave notification to its participants.
pub struct WorkerPool {
    fanout: Arc<FanoutAdapter>,
    workers: Vec<WorkerSlot>,
    next: AtomicUsize,
    rooms: DashMap<Id, Arc<OnceCell<Arc<VoiceRoom>>>>,
    /// Single live voice session per user, process-wide: the channel plus
    /// the gateway connection that owns the session. Only the owning
    /// connection's close tears the session down.
    user_channels: DashMap<Id, (Id, ConnectionId)>,
}

impl WorkerPool {
    pub async fn init(
        engine: Arc<dyn MediaEngine>,
        fanout: Arc<FanoutAdapter>,
        worker_count: usize,
    ) -> Result<Arc<Self>, CoreError> {
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count.max(1) {
            let worker = engine.create_worker().await?;
            workers.push(WorkerSlot {
                worker,
                alive: Arc::new(AtomicBool::new(true)),
            });
        }
        tracing::info!(workers = workers.len(), "media worker pool initialized");

        let pool = Arc::new(Self {
            fanout,
            workers,
            next: AtomicUsize::new(0),
            rooms: DashMap::new(),
            user_channels: DashMap::new(),
        });

        for index in 0..pool.workers.len() {
            let mut died = pool.workers[index].worker.died();
            let pool = pool.clone();
            tokio::spawn(async move {
                while died.changed().await.is_ok() {
                    if *died.borrow() {
                        pool.handle_worker_death(index).await;
                        return;
                    }
                }
            });
        }
        Ok(pool)
    }

    /// Round-robin over live workers; used only at room creation so every
    /// participant of a channel shares one worker's router.
    fn assign_worker(&self) -> Result<usize, CoreError> {
        for _ in 0..self.workers.len() {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
            if self.workers[index].alive.load(Ordering::Relaxed) {
                return Ok(index);
            }
        }
        Err(CoreError::Unavailable)
    }

    /// Idempotent and single-flight: concurrent calls for the same
    /// not-yet-existing channel resolve to exactly one created room, with
    /// later callers awaiting the first creation.
    pub async fn get_or_create_room(
        &self,
        channel_id: Id,
        server_id: Id,
    ) -> Result<Arc<VoiceRoom>, CoreError> {
        let cell = self
            .rooms
            .entry(channel_id)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let result = cell
            .get_or_try_init(|| async {
                let index = self.assign_worker()?;
                let router = self.workers[index].worker.create_router().await?;
                tracing::info!(channel_id, worker = index, "voice room created");
                Ok::<_, CoreError>(Arc::new(VoiceRoom::new(
                    channel_id,
                    server_id,
                    index,
                    router,
                    self.fanout.clone(),
                )))
            })
            .await;
        match result {
            Ok(room) => Ok(room.clone()),
            Err(err) => {
                // A creation failure must not leave an empty cell in the
                // map. A concurrent caller may have succeeded since, so
                // only still-uninitialized entries are dropped.
                self.rooms.remove_if(&channel_id, |_, c| c.get().is_none());
                Err(err)
            }
        }
    }

    pub fn get_room(&self, channel_id: Id) -> Option<Arc<VoiceRoom>> {
        self.rooms
            .get(&channel_id)
            .and_then(|cell| cell.get().cloned())
    }

    /// The channel this user currently has a voice session in, if any.
    pub fn active_channel(&self, user_id: Id) -> Option<Id> {
        self.user_channels.get(&user_id).map(|s| s.0)
    }

    pub async fn join(
        &self,
        channel_id: Id,
        server_id: Id,
        user_id: Id,
        conn: ConnectionId,
    ) -> Result<VoiceJoinInfo, CoreError> {
        let room = self.get_or_create_room(channel_id, server_id).await?;
        match room.join(user_id).await {
            Ok(info) => {
                self.user_channels.insert(user_id, (channel_id, conn));
                Ok(info)
            }
            Err(err) => {
                // A failed first join must not leave an empty room behind.
                if room.is_empty().await {
                    self.remove_room(channel_id).await;
                }
                Err(err)
            }
        }
    }

    pub async fn leave(&self, channel_id: Id, user_id: Id) -> Result<(), CoreError> {
        let room = self
            .get_room(channel_id)
            .ok_or(CoreError::NotFound("room"))?;
        let remaining = room.leave(user_id).await?;
        self.user_channels
            .remove_if(&user_id, |_, (ch, _)| *ch == channel_id);
        if remaining == 0 {
            self.remove_room(channel_id).await;
        }
        Ok(())
    }

    /// Implicit leave when the gateway connection `conn` closes. A session
    /// owned by one of the user's other connections is left alone.
    pub async fn disconnect(&self, user_id: Id, conn: ConnectionId) {
        let owned = self
            .user_channels
            .get(&user_id)
            .filter(|s| s.1 == conn)
            .map(|s| s.0);
        if let Some(channel_id) = owned {
            if let Err(err) = self.leave(channel_id, user_id).await {
                tracing::debug!(user_id, channel_id, "disconnect cleanup: {err}");
            }
        }
    }

    pub async fn remove_room(&self, channel_id: Id) {
        if let Some((_, cell)) = self.rooms.remove(&channel_id) {
            if let Some(room) = cell.get() {
                room.close().await;
                tracing::info!(channel_id, "voice room destroyed");
            }
        }
    }

    async fn handle_worker_death(&self, index: usize) {
        self.workers[index].alive.store(false, Ordering::Relaxed);
        let doomed: Vec<(Id, Arc<VoiceRoom>)> = self
            .rooms
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .get()
                    .filter(|room| room.worker_index() == index)
                    .map(|room| (*entry.key(), room.clone()))
            })
            .collect();
        tracing::warn!(
            worker = index,
            rooms = doomed.len(),
            "media worker died, evicting its rooms"
        );
        for (channel_id, room) in doomed {
            self.rooms.remove(&channel_id);
            let evicted = room.force_close("media worker died").await;
            for user_id in evicted {
                self.user_channels
                    .remove_if(&user_id, |_, (ch, _)| *ch == channel_id);
            }
        }
    }

    /// Close every room, then every worker. Process termination only.
    pub async fn shutdown_all(&self) {
        let channels: Vec<Id> = self.rooms.iter().map(|e| *e.key()).collect();
        for channel_id in channels {
            if let Some((_, cell)) = self.rooms.remove(&channel_id) {
                if let Some(room) = cell.get() {
                    room.force_close("server shutting down").await;
                }
            }
        }
        self.user_channels.clear();
        for slot in &self.workers {
            slot.worker.close().await;
        }
        tracing::info!("media worker pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalMediaEngine;
    use filament_core::{Broker, ConnectionRegistry, MemoryBroker, MemoryBrokerHub};

    fn test_env() -> (Arc<FanoutAdapter>, Arc<ConnectionRegistry>) {
        let hub = MemoryBrokerHub::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::connect(&hub));
        (FanoutAdapter::new(broker, registry.clone()), registry)
    }

    fn test_fanout() -> Arc<FanoutAdapter> {
        test_env().0
    }

    #[tokio::test]
    async fn concurrent_creation_is_single_flight() {
        let engine = LocalMediaEngine::new();
        let pool = WorkerPool::init(engine.clone(), test_fanout(), 2)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(
                async move { pool.get_or_create_room(1, 10).await },
            ));
        }
        let rooms: Vec<Arc<VoiceRoom>> = futures_join(handles).await;

        assert_eq!(engine.routers_created(), 1, "exactly one router created");
        for room in &rooms[1..] {
            assert!(Arc::ptr_eq(&rooms[0], room));
        }
    }

    async fn futures_join(
        handles: Vec<tokio::task::JoinHandle<Result<Arc<VoiceRoom>, CoreError>>>,
    ) -> Vec<Arc<VoiceRoom>> {
        let mut rooms = Vec::new();
        for handle in handles {
            rooms.push(handle.await.unwrap().unwrap());
        }
        rooms
    }

    #[tokio::test]
    async fn room_creation_round_robins_workers() {
        let engine = LocalMediaEngine::new();
        let pool = WorkerPool::init(engine, test_fanout(), 2).await.unwrap();

        let first = pool.get_or_create_room(1, 10).await.unwrap();
        let second = pool.get_or_create_room(2, 10).await.unwrap();
        assert_ne!(first.worker_index(), second.worker_index());

        // Everyone in one channel shares the already-assigned worker.
        let again = pool.get_or_create_room(1, 10).await.unwrap();
        assert_eq!(first.worker_index(), again.worker_index());
    }

    #[tokio::test]
    async fn dead_worker_is_skipped_then_pool_exhausts() {
        let engine = LocalMediaEngine::new();
        let pool = WorkerPool::init(engine.clone(), test_fanout(), 2)
            .await
            .unwrap();

        engine.kill_worker(0).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Both new rooms must land on the surviving worker.
        let a = pool.get_or_create_room(1, 10).await.unwrap();
        let b = pool.get_or_create_room(2, 10).await.unwrap();
        assert_eq!(a.worker_index(), b.worker_index());

        engine.kill_worker(1).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(matches!(
            pool.get_or_create_room(3, 10).await,
            Err(CoreError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn failed_first_join_leaves_no_empty_room() {
        let engine = LocalMediaEngine::new();
        let (fanout, registry) = test_env();
        let pool = WorkerPool::init(engine, fanout, 1).await.unwrap();
        let (conn, _rx) = registry.register(7);

        let room = pool.get_or_create_room(1, 10).await.unwrap();
        room.join(7).await.unwrap();
        // Duplicate join in the same room is rejected and must not disturb
        // the existing session.
        assert!(matches!(
            pool.join(1, 10, 7, conn).await,
            Err(CoreError::AlreadyJoined)
        ));
        assert!(pool.get_room(1).is_some());
        assert_eq!(room.participant_count().await, 1);
    }

    #[tokio::test]
    async fn failed_room_creation_leaves_no_map_entry() {
        let engine = LocalMediaEngine::new();
        let pool = WorkerPool::init(engine.clone(), test_fanout(), 1)
            .await
            .unwrap();

        engine.kill_worker(0).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(matches!(
            pool.get_or_create_room(1, 10).await,
            Err(CoreError::Unavailable)
        ));
        assert!(pool.rooms.is_empty(), "failed creation left an entry");
    }

    #[tokio::test]
    async fn disconnect_from_a_non_owning_connection_is_ignored() {
        let engine = LocalMediaEngine::new();
        let (fanout, registry) = test_env();
        let pool = WorkerPool::init(engine, fanout, 1).await.unwrap();

        // One user, two devices; only the first is in voice.
        let (conn_a, _rx_a) = registry.register(7);
        let (conn_b, _rx_b) = registry.register(7);
        pool.join(1, 10, 7, conn_a).await.unwrap();

        pool.disconnect(7, conn_b).await;
        assert_eq!(pool.active_channel(7), Some(1));
        assert!(pool.get_room(1).is_some());

        pool.disconnect(7, conn_a).await;
        assert_eq!(pool.active_channel(7), None);
        assert!(pool.get_room(1).is_none());
    }
}
