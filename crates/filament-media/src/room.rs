use std::collections::HashMap;
use std::sync::Arc;

use filament_core::{CoreError, FanoutAdapter};
use filament_models::{GatewayEvent, Id, ProducerType, RemoteProducer, TransportParams};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::engine::MediaRouter;

/// Lifecycle of one participant inside a room. `Gone` is represented by
/// absence from the participant map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParticipantState {
    Joining,
    Joined,
    Leaving,
}

struct ParticipantSession {
    user_id: Id,
    state: ParticipantState,
    send_transport_id: Option<String>,
    recv_transport_id: Option<String>,
    send_connected: bool,
    recv_connected: bool,
    /// producer id → policy slot. At most one producer per slot.
    producers: HashMap<String, ProducerType>,
    consumers: Vec<String>,
    self_mute: bool,
    self_deaf: bool,
}

impl ParticipantSession {
    fn joining(user_id: Id) -> Self {
        Self {
            user_id,
            state: ParticipantState::Joining,
            send_transport_id: None,
            recv_transport_id: None,
            send_connected: false,
            recv_connected: false,
            producers: HashMap::new(),
            consumers: Vec::new(),
            self_mute: false,
            self_deaf: false,
        }
    }
}

/// Everything a freshly-joined participant needs: its transport parameters
/// and the producers already live in the room.
#[derive(Debug, Clone)]
pub struct VoiceJoinInfo {
    pub channel_id: Id,
    pub send_transport: TransportParams,
    pub recv_transport: TransportParams,
    pub existing_producers: Vec<RemoteProducer>,
}

/// Per-voice-channel session state machine. Coordinates participant
/// join/produce/consume/leave against one worker's router. Every failure is
/// a typed error returned to the single caller; nothing here can take down
/// the room or other participants' sessions.
pub struct VoiceRoom {
    channel_id: Id,
    server_id: Id,
    worker_index: usize,
    router: Arc<dyn MediaRouter>,
    fanout: Arc<FanoutAdapter>,
    participants: Mutex<HashMap<Id, ParticipantSession>>,
}

impl VoiceRoom {
    pub(crate) fn new(
        channel_id: Id,
        server_id: Id,
        worker_index: usize,
        router: Arc<dyn MediaRouter>,
        fanout: Arc<FanoutAdapter>,
    ) -> Self {
        Self {
            channel_id,
            server_id,
            worker_index,
            router,
            fanout,
            participants: Mutex::new(HashMap::new()),
        }
    }

    pub fn channel_id(&self) -> Id {
        self.channel_id
    }

    pub fn server_id(&self) -> Id {
        self.server_id
    }

    pub(crate) fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub async fn participant_count(&self) -> usize {
        self.participants.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.participants.lock().await.is_empty()
    }

    /// Producers visible to `user_id`: everything in the room that belongs
    /// to somebody else.
    pub async fn remote_producers(&self, user_id: Id) -> Vec<RemoteProducer> {
        let participants = self.participants.lock().await;
        Self::collect_remote_producers(&participants, user_id)
    }

    fn collect_remote_producers(
        participants: &HashMap<Id, ParticipantSession>,
        user_id: Id,
    ) -> Vec<RemoteProducer> {
        participants
            .values()
            .filter(|s| s.user_id != user_id && s.state == ParticipantState::Joined)
            .flat_map(|s| {
                s.producers.iter().map(|(producer_id, producer_type)| RemoteProducer {
                    user_id: s.user_id,
                    producer_id: producer_id.clone(),
                    producer_type: *producer_type,
                })
            })
            .collect()
    }

    /// Allocate transports for a new participant. Fails with `AlreadyJoined`
    /// if the user already has a session here (the one-session-per-user rule
    /// across channels is enforced above the room, at the dispatcher).
    pub async fn join(&self, user_id: Id) -> Result<VoiceJoinInfo, CoreError> {
        {
            let mut participants = self.participants.lock().await;
            if participants.contains_key(&user_id) {
                return Err(CoreError::AlreadyJoined);
            }
            // Marker entry keeps a second concurrent join out while the
            // transports are being created.
            participants.insert(user_id, ParticipantSession::joining(user_id));
        }

        let send_transport = match self.router.create_transport().await {
            Ok(transport) => transport,
            Err(err) => {
                self.participants.lock().await.remove(&user_id);
                return Err(err);
            }
        };
        let recv_transport = match self.router.create_transport().await {
            Ok(transport) => transport,
            Err(err) => {
                self.router.close_transport(&send_transport.id).await;
                self.participants.lock().await.remove(&user_id);
                return Err(err);
            }
        };

        let mut participants = self.participants.lock().await;
        let existing_producers = Self::collect_remote_producers(&participants, user_id);
        // The session may have been evicted while we awaited the engine
        // (worker died, forced close); treat that as the join having lost.
        let Some(session) = participants.get_mut(&user_id) else {
            drop(participants);
            self.router.close_transport(&send_transport.id).await;
            self.router.close_transport(&recv_transport.id).await;
            return Err(CoreError::NotFound("participant"));
        };
        session.state = ParticipantState::Joined;
        session.send_transport_id = Some(send_transport.id.clone());
        session.recv_transport_id = Some(recv_transport.id.clone());

        Ok(VoiceJoinInfo {
            channel_id: self.channel_id,
            send_transport,
            recv_transport,
            existing_producers,
        })
    }

    /// Idempotent: retrying with an already-connected transport is a no-op
    /// success rather than a duplicate engine call.
    pub async fn connect_transport(
        &self,
        user_id: Id,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> Result<(), CoreError> {
        enum Side {
            Send,
            Recv,
        }
        let side = {
            let participants = self.participants.lock().await;
            let session = participants
                .get(&user_id)
                .ok_or(CoreError::NotFound("participant"))?;
            if session.send_transport_id.as_deref() == Some(transport_id) {
                if session.send_connected {
                    return Ok(());
                }
                Side::Send
            } else if session.recv_transport_id.as_deref() == Some(transport_id) {
                if session.recv_connected {
                    return Ok(());
                }
                Side::Recv
            } else {
                return Err(CoreError::NotFound("transport"));
            }
        };

        self.router
            .connect_transport(transport_id, dtls_parameters)
            .await?;

        let mut participants = self.participants.lock().await;
        if let Some(session) = participants.get_mut(&user_id) {
            match side {
                Side::Send => session.send_connected = true,
                Side::Recv => session.recv_connected = true,
            }
        }
        Ok(())
    }

    /// Create a producer on the participant's send transport and advertise
    /// it to everyone else in the room, local and remote.
    pub async fn produce(
        &self,
        user_id: Id,
        transport_id: &str,
        producer_type: ProducerType,
        rtp_parameters: Value,
    ) -> Result<String, CoreError> {
        {
            let participants = self.participants.lock().await;
            let session = participants
                .get(&user_id)
                .ok_or(CoreError::NotFound("participant"))?;
            if session.send_transport_id.as_deref() != Some(transport_id) {
                return Err(CoreError::NotFound("transport"));
            }
            if session.producers.values().any(|t| *t == producer_type) {
                return Err(CoreError::AlreadyExists(producer_type.as_str()));
            }
        }

        let producer_id = self
            .router
            .produce(transport_id, producer_type, rtp_parameters)
            .await?;

        {
            let mut participants = self.participants.lock().await;
            match participants.get_mut(&user_id) {
                Some(session) => {
                    session.producers.insert(producer_id.clone(), producer_type);
                }
                None => {
                    // Participant left while the engine call was in flight.
                    drop(participants);
                    self.router.close_producer(&producer_id).await;
                    return Err(CoreError::NotFound("participant"));
                }
            }
        }

        self.publish(
            GatewayEvent::ProducerAvailable {
                channel_id: self.channel_id,
                user_id,
                producer_id: producer_id.clone(),
                producer_type,
            },
            Some(user_id),
        )
        .await;
        Ok(producer_id)
    }

    /// Bind a consumer for `producer_id` to the participant's receive
    /// transport. The producer may have closed between the advertisement and
    /// this request; that race is a typed `NotFound`, never a crash.
    pub async fn consume(
        &self,
        user_id: Id,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> Result<filament_models::ConsumerParams, CoreError> {
        let recv_transport_id = {
            let participants = self.participants.lock().await;
            let session = participants
                .get(&user_id)
                .ok_or(CoreError::NotFound("participant"))?;
            let recv = session
                .recv_transport_id
                .clone()
                .ok_or(CoreError::NotFound("transport"))?;
            if !participants
                .values()
                .any(|s| s.producers.contains_key(producer_id))
            {
                return Err(CoreError::NotFound("producer"));
            }
            recv
        };

        let consumer = self
            .router
            .consume(&recv_transport_id, producer_id, rtp_capabilities)
            .await?;

        let mut participants = self.participants.lock().await;
        if let Some(session) = participants.get_mut(&user_id) {
            session.consumers.push(consumer.id.clone());
        }
        Ok(consumer)
    }

    /// Close one of the participant's producers by policy slot (used for
    /// stop-screen-share) and tell peers to tear down their consumers.
    pub async fn stop_producer(
        &self,
        user_id: Id,
        producer_type: ProducerType,
    ) -> Result<String, CoreError> {
        let producer_id = {
            let mut participants = self.participants.lock().await;
            let session = participants
                .get_mut(&user_id)
                .ok_or(CoreError::NotFound("participant"))?;
            let producer_id = session
                .producers
                .iter()
                .find(|(_, t)| **t == producer_type)
                .map(|(id, _)| id.clone())
                .ok_or(CoreError::NotFound("producer"))?;
            session.producers.remove(&producer_id);
            producer_id
        };

        self.router.close_producer(&producer_id).await;
        self.publish(
            GatewayEvent::ProducerClosed {
                channel_id: self.channel_id,
                user_id,
                producer_id: producer_id.clone(),
            },
            None,
        )
        .await;
        Ok(producer_id)
    }

    /// Update mute/deafen flags and rebroadcast the voice state.
    pub async fn set_voice_state(
        &self,
        user_id: Id,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<(), CoreError> {
        {
            let mut participants = self.participants.lock().await;
            let session = participants
                .get_mut(&user_id)
                .ok_or(CoreError::NotFound("participant"))?;
            session.self_mute = self_mute;
            // Deafen implies mute.
            session.self_mute |= self_deaf;
            session.self_deaf = self_deaf;
        }
        self.publish(
            GatewayEvent::VoiceStateUpdate {
                channel_id: self.channel_id,
                user_id,
                self_mute: self_mute || self_deaf,
                self_deaf,
            },
            None,
        )
        .await;
        Ok(())
    }

    /// Tear down a participant: consumers, producers, transports, session.
    /// Peers receive one producer-closed event per producer that existed.
    /// Returns how many participants remain so the pool can destroy the
    /// room when the last one leaves.
    pub async fn leave(&self, user_id: Id) -> Result<usize, CoreError> {
        let mut session = {
            let mut participants = self.participants.lock().await;
            let mut session = participants
                .remove(&user_id)
                .ok_or(CoreError::NotFound("participant"))?;
            session.state = ParticipantState::Leaving;
            session
        };

        for consumer_id in session.consumers.drain(..) {
            self.router.close_consumer(&consumer_id).await;
        }
        let producers: Vec<String> = session.producers.drain().map(|(id, _)| id).collect();
        for producer_id in &producers {
            self.router.close_producer(producer_id).await;
        }
        for transport_id in [&session.send_transport_id, &session.recv_transport_id]
            .into_iter()
            .flatten()
        {
            self.router.close_transport(transport_id).await;
        }

        for producer_id in producers {
            self.publish(
                GatewayEvent::ProducerClosed {
                    channel_id: self.channel_id,
                    user_id,
                    producer_id,
                },
                None,
            )
            .await;
        }
        self.publish(
            GatewayEvent::VoiceLeft {
                channel_id: self.channel_id,
                user_id,
            },
            None,
        )
        .await;

        Ok(self.participants.lock().await.len())
    }

    /// Evict every participant at once (worker death, shutdown). Each one
    /// gets a forced-leave notification on their user channel. Returns the
    /// evicted user ids so the pool can release their session slots.
    pub(crate) async fn force_close(&self, reason: &str) -> Vec<Id> {
        let sessions: Vec<ParticipantSession> = {
            let mut participants = self.participants.lock().await;
            participants.drain().map(|(_, s)| s).collect()
        };
        self.router.close().await;

        let evicted: Vec<Id> = sessions.iter().map(|s| s.user_id).collect();
        for session in sessions {
            if let Err(err) = self
                .fanout
                .publish_to_user(
                    session.user_id,
                    GatewayEvent::VoiceForcedLeave {
                        channel_id: self.channel_id,
                        reason: reason.to_string(),
                    },
                )
                .await
            {
                tracing::warn!(
                    user_id = session.user_id,
                    channel_id = self.channel_id,
                    "failed to notify forced leave: {err}"
                );
            }
        }
        evicted
    }

    pub(crate) async fn close(&self) {
        self.router.close().await;
    }

    async fn publish(&self, event: GatewayEvent, exclude_user: Option<Id>) {
        if let Err(err) = self
            .fanout
            .publish_to_server(self.server_id, event, exclude_user)
            .await
        {
            tracing::warn!(
                channel_id = self.channel_id,
                server_id = self.server_id,
                "voice event publish failed: {err}"
            );
        }
    }
}
