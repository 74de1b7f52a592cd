use axum::extract::ws::{CloseFrame, Message, WebSocket};
use filament_core::{CoreError, Frame};
use filament_models::gateway::{ClientOp, ErrorCode, GatewayEvent};
use filament_models::{Id, ProducerType};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::session::Session;
use crate::GatewayState;

struct ConnectionGuard {
    state: GatewayState,
    acquired: bool,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.acquired {
            self.state.active_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

fn try_acquire_connection_slot(state: &GatewayState) -> bool {
    let max = state.limits.max_connections;
    let counter = &state.active_connections;
    let mut current = counter.load(Ordering::SeqCst);
    loop {
        if current >= max {
            return false;
        }
        match counter.compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return true,
            Err(observed) => current = observed,
        }
    }
}

fn encode(event: &GatewayEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::error!("failed to serialize gateway event: {err}");
            None
        }
    }
}

async fn send_event(
    sender: &mut (impl SinkExt<Message> + Unpin),
    event: &GatewayEvent,
) -> Result<(), ()> {
    let Some(text) = encode(event) else {
        return Ok(());
    };
    sender.send(Message::Text(text.into())).await.map_err(|_| ())
}

async fn send_close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
) {
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

fn error_event(err: &CoreError) -> GatewayEvent {
    GatewayEvent::OpError {
        code: err.code(),
        message: err.to_string(),
    }
}

pub async fn handle_connection(socket: WebSocket, state: GatewayState) {
    let mut guard = ConnectionGuard {
        state: state.clone(),
        acquired: false,
    };
    if !try_acquire_connection_slot(&state) {
        let (mut sender, _) = socket.split();
        send_close(&mut sender, 1013, "gateway is at connection capacity").await;
        return;
    }
    guard.acquired = true;

    let (mut sender, mut receiver) = socket.split();

    let hello = GatewayEvent::Hello {
        heartbeat_interval: state.limits.heartbeat_interval.as_millis() as u64,
    };
    if send_event(&mut sender, &hello).await.is_err() {
        return;
    }

    let user_id = match tokio::time::timeout(
        state.limits.identify_timeout,
        wait_for_identify(&mut receiver, &state),
    )
    .await
    {
        Ok(Some(user_id)) => user_id,
        _ => {
            send_close(&mut sender, 1008, "authentication failed").await;
            return;
        }
    };

    let (conn_id, mut frames) = state.registry.register(user_id);
    let session = Session::new(conn_id, user_id);
    tracing::info!(
        user_id,
        session_id = %session.session_id,
        "gateway connection identified"
    );

    // Subscribe the connection to every server the user belongs to. The
    // client can still narrow or widen the set with explicit ops.
    for server_id in state.membership.server_ids_for_user(user_id).await {
        state.registry.subscribe(conn_id, server_id);
        if let Err(err) = state.fanout.subscribe_server(server_id).await {
            tracing::warn!(server_id, "server subscription failed: {err}");
        }
    }
    if let Err(err) = state.fanout.subscribe_user(user_id).await {
        tracing::warn!(user_id, "user channel subscription failed: {err}");
    }

    let ready = GatewayEvent::Ready {
        user_id,
        session_id: session.session_id.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        cleanup(&state, &session).await;
        return;
    }

    if let Err(err) = state.presence.connection_opened(user_id).await {
        tracing::warn!(user_id, "presence update on connect failed: {err}");
    }

    let reason = run_session(&mut sender, &mut receiver, &mut frames, &session, &state).await;
    tracing::info!(
        user_id,
        session_id = %session.session_id,
        reason,
        "gateway connection closed"
    );
    frames.close();

    cleanup(&state, &session).await;
}

/// Scan inbound frames for an IDENTIFY op and validate its token. Anything
/// else before identification is ignored.
async fn wait_for_identify(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &GatewayState,
) -> Option<Id> {
    while let Some(Ok(msg)) = receiver.next().await {
        if let Message::Text(text) = msg {
            if let Ok(ClientOp::Identify { token }) = serde_json::from_str::<ClientOp>(&text) {
                return state.auth.authenticate(&token).await;
            }
        }
    }
    None
}

async fn run_session(
    sender: &mut (impl SinkExt<Message> + Unpin),
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    frames: &mut mpsc::Receiver<Frame>,
    session: &Session,
    state: &GatewayState,
) -> &'static str {
    let heartbeat_timeout = state.limits.heartbeat_timeout;
    let heartbeat_sleep = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_sleep);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let op = match serde_json::from_str::<ClientOp>(&text) {
                            Ok(op) => op,
                            Err(err) => {
                                tracing::debug!(
                                    user_id = session.user_id,
                                    "malformed client op: {err}"
                                );
                                let reject = GatewayEvent::OpError {
                                    code: ErrorCode::Malformed,
                                    message: "unrecognized operation".to_string(),
                                };
                                if send_event(sender, &reject).await.is_err() {
                                    break "websocket send error";
                                }
                                continue;
                            }
                        };
                        if matches!(op, ClientOp::Heartbeat) {
                            heartbeat_sleep
                                .as_mut()
                                .reset(Instant::now() + heartbeat_timeout);
                        }
                        let mut send_failed = false;
                        for event in dispatch_op(state, session, op).await {
                            if send_event(sender, &event).await.is_err() {
                                send_failed = true;
                                break;
                            }
                        }
                        if send_failed {
                            break "websocket send error";
                        }
                    }
                    Some(Ok(Message::Close(_))) => break "client close frame",
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break "websocket receive error",
                    None => break "websocket stream ended",
                }
            }
            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        if sender
                            .send(Message::Text(frame.to_string().into()))
                            .await
                            .is_err()
                        {
                            break "websocket send error";
                        }
                    }
                    None => break "outbound channel closed",
                }
            }
            () = &mut heartbeat_sleep => {
                send_close(sender, 4009, "heartbeat timed out").await;
                break "heartbeat timed out";
            }
        }
    }
}

/// Route one client op to the owning service. Returns the direct replies for
/// this connection; broadcast side effects travel through the fanout adapter.
async fn dispatch_op(state: &GatewayState, session: &Session, op: ClientOp) -> Vec<GatewayEvent> {
    let user_id = session.user_id;
    let result: Result<Vec<GatewayEvent>, CoreError> = match op {
        ClientOp::Identify { .. } => Err(CoreError::Malformed(
            "session is already identified".to_string(),
        )),
        ClientOp::Heartbeat => {
            if let Err(err) = state.presence.heartbeat(user_id).await {
                tracing::debug!(user_id, "presence refresh on heartbeat failed: {err}");
            }
            Ok(vec![GatewayEvent::HeartbeatAck])
        }
        ClientOp::SubscribeServer { server_id } => {
            if !state
                .membership
                .server_ids_for_user(user_id)
                .await
                .contains(&server_id)
            {
                Err(CoreError::NotFound("server"))
            } else {
                state.registry.subscribe(session.conn_id, server_id);
                state.fanout.subscribe_server(server_id).await.map(|()| vec![])
            }
        }
        ClientOp::UnsubscribeServer { server_id } => {
            state.registry.unsubscribe(session.conn_id, server_id);
            state
                .fanout
                .unsubscribe_server(server_id)
                .await
                .map(|()| vec![])
        }
        ClientOp::PresenceUpdate { status } => {
            state.presence.set_status(user_id, status).await.map(|()| vec![])
        }
        ClientOp::TypingStart { channel_id } => state
            .typing
            .typing_started(channel_id, user_id)
            .await
            .map(|()| vec![]),
        ClientOp::VoiceJoin { channel_id } => voice_join(state, session, channel_id).await,
        ClientOp::VoiceConnectTransport {
            channel_id,
            transport_id,
            dtls_parameters,
        } => match state.voice.get_room(channel_id) {
            Some(room) => room
                .connect_transport(user_id, &transport_id, dtls_parameters)
                .await
                .map(|()| vec![GatewayEvent::TransportConnected { transport_id }]),
            None => Err(CoreError::NotFound("room")),
        },
        ClientOp::VoiceProduce {
            channel_id,
            transport_id,
            producer_type,
            rtp_parameters,
        } => match state.voice.get_room(channel_id) {
            Some(room) => room
                .produce(user_id, &transport_id, producer_type, rtp_parameters)
                .await
                .map(|producer_id| {
                    vec![GatewayEvent::ProducerCreated {
                        producer_id,
                        producer_type,
                    }]
                }),
            None => Err(CoreError::NotFound("room")),
        },
        ClientOp::VoiceConsume {
            channel_id,
            producer_id,
            rtp_capabilities,
        } => match state.voice.get_room(channel_id) {
            Some(room) => room
                .consume(user_id, &producer_id, rtp_capabilities)
                .await
                .map(|consumer| {
                    vec![GatewayEvent::ConsumerCreated {
                        channel_id,
                        consumer,
                    }]
                }),
            None => Err(CoreError::NotFound("room")),
        },
        ClientOp::VoiceStopScreenShare { channel_id } => match state.voice.get_room(channel_id) {
            Some(room) => room
                .stop_producer(user_id, ProducerType::Screen)
                .await
                .map(|_| vec![]),
            None => Err(CoreError::NotFound("room")),
        },
        ClientOp::VoiceStateUpdate {
            channel_id,
            self_mute,
            self_deaf,
        } => match state.voice.get_room(channel_id) {
            Some(room) => room
                .set_voice_state(user_id, self_mute, self_deaf)
                .await
                .map(|()| vec![]),
            None => Err(CoreError::NotFound("room")),
        },
        ClientOp::VoiceLeave { channel_id } => {
            state.voice.leave(channel_id, user_id).await.map(|()| vec![])
        }
    };

    match result {
        Ok(events) => events,
        Err(err) => {
            tracing::debug!(user_id, "client op rejected: {err}");
            vec![error_event(&err)]
        }
    }
}

/// One live voice session per user: joining a second channel implicitly
/// leaves the first.
async fn voice_join(
    state: &GatewayState,
    session: &Session,
    channel_id: Id,
) -> Result<Vec<GatewayEvent>, CoreError> {
    let user_id = session.user_id;
    let server_id = state
        .membership
        .server_for_channel(channel_id)
        .await
        .ok_or(CoreError::NotFound("channel"))?;

    if let Some(previous) = state.voice.active_channel(user_id) {
        if previous == channel_id {
            return Err(CoreError::AlreadyJoined);
        }
        tracing::info!(
            user_id,
            from_channel = previous,
            to_channel = channel_id,
            "migrating voice session"
        );
        if let Err(err) = state.voice.leave(previous, user_id).await {
            tracing::warn!(user_id, channel_id = previous, "migration leave failed: {err}");
        }
    }

    let info = state
        .voice
        .join(channel_id, server_id, user_id, session.conn_id)
        .await?;
    Ok(vec![GatewayEvent::VoiceJoined {
        channel_id: info.channel_id,
        send_transport: info.send_transport,
        recv_transport: info.recv_transport,
        existing_producers: info.existing_producers,
    }])
}

/// Teardown cascade for a closed connection: implicit voice leave, registry
/// removal, presence re-evaluation, best-effort broker unsubscribes.
async fn cleanup(state: &GatewayState, session: &Session) {
    state.voice.disconnect(session.user_id, session.conn_id).await;

    if let Some(removed) = state.registry.remove(session.conn_id) {
        for server_id in removed.server_ids {
            if let Err(err) = state.fanout.unsubscribe_server(server_id).await {
                tracing::debug!(server_id, "server unsubscribe failed: {err}");
            }
        }
        if let Err(err) = state
            .presence
            .connection_closed(removed.user_id, session.conn_id)
            .await
        {
            tracing::warn!(
                user_id = removed.user_id,
                "presence update on disconnect failed: {err}"
            );
        }
        if let Err(err) = state.fanout.unsubscribe_user(removed.user_id).await {
            tracing::debug!(user_id = removed.user_id, "user unsubscribe failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GatewayLimits, GatewayState};
    use filament_core::{
        Authenticator, Broker, ConnectionRegistry, FanoutAdapter, MemoryBroker, MemoryBrokerHub,
        PresenceTracker, StaticMembership, StaticTokenAuth, TypingTracker, DEFAULT_PRESENCE_TTL,
        DEFAULT_TYPING_TTL,
    };
    use filament_media::{LocalMediaEngine, WorkerPool};
    use std::sync::Arc;

    const USER: Id = 1;
    const SERVER: Id = 10;
    const CHANNEL_A: Id = 100;
    const CHANNEL_B: Id = 101;

    async fn test_state() -> GatewayState {
        let hub = MemoryBrokerHub::new();
        let registry = Arc::new(ConnectionRegistry::new());
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::connect(&hub));
        let fanout = FanoutAdapter::new(broker.clone(), registry.clone());
        tokio::spawn(fanout.clone().run());

        let membership = Arc::new(StaticMembership::new());
        membership.add_user(USER, "alice");
        membership.add_member(USER, SERVER);
        membership.add_channel(CHANNEL_A, SERVER);
        membership.add_channel(CHANNEL_B, SERVER);

        let auth = Arc::new(StaticTokenAuth::new());
        auth.insert("alice-token", USER);

        let presence = Arc::new(PresenceTracker::new(
            broker.clone(),
            fanout.clone(),
            registry.clone(),
            membership.clone(),
            DEFAULT_PRESENCE_TTL,
        ));
        let typing = Arc::new(TypingTracker::new(
            broker,
            fanout.clone(),
            membership.clone(),
            DEFAULT_TYPING_TTL,
        ));
        let voice = WorkerPool::init(LocalMediaEngine::new(), fanout.clone(), 1)
            .await
            .unwrap();

        GatewayState::new(
            registry,
            fanout,
            presence,
            typing,
            voice,
            membership,
            auth as Arc<dyn Authenticator>,
            GatewayLimits::default(),
        )
    }

    fn test_session(state: &GatewayState) -> Session {
        let (conn_id, _rx) = state.registry.register(USER);
        Session::new(conn_id, USER)
    }

    #[tokio::test]
    async fn heartbeat_is_acked() {
        let state = test_state().await;
        let session = test_session(&state);

        let events = dispatch_op(&state, &session, ClientOp::Heartbeat).await;
        assert!(matches!(events.as_slice(), [GatewayEvent::HeartbeatAck]));
    }

    #[tokio::test]
    async fn malformed_and_unknown_targets_surface_typed_errors() {
        let state = test_state().await;
        let session = test_session(&state);

        let events = dispatch_op(
            &state,
            &session,
            ClientOp::SubscribeServer { server_id: 999 },
        )
        .await;
        assert!(matches!(
            events.as_slice(),
            [GatewayEvent::OpError {
                code: ErrorCode::NotFound,
                ..
            }]
        ));

        let events = dispatch_op(
            &state,
            &session,
            ClientOp::VoiceJoin { channel_id: 999 },
        )
        .await;
        assert!(matches!(
            events.as_slice(),
            [GatewayEvent::OpError {
                code: ErrorCode::NotFound,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn voice_join_replies_with_transports() {
        let state = test_state().await;
        let session = test_session(&state);

        let events = dispatch_op(
            &state,
            &session,
            ClientOp::VoiceJoin {
                channel_id: CHANNEL_A,
            },
        )
        .await;
        match events.as_slice() {
            [GatewayEvent::VoiceJoined {
                channel_id,
                existing_producers,
                ..
            }] => {
                assert_eq!(*channel_id, CHANNEL_A);
                assert!(existing_producers.is_empty());
            }
            other => panic!("expected voice-joined, got {other:?}"),
        }
        assert_eq!(state.voice.active_channel(USER), Some(CHANNEL_A));
    }

    #[tokio::test]
    async fn second_join_migrates_to_the_new_channel() {
        let state = test_state().await;
        let session = test_session(&state);

        dispatch_op(
            &state,
            &session,
            ClientOp::VoiceJoin {
                channel_id: CHANNEL_A,
            },
        )
        .await;
        let events = dispatch_op(
            &state,
            &session,
            ClientOp::VoiceJoin {
                channel_id: CHANNEL_B,
            },
        )
        .await;

        assert!(matches!(
            events.as_slice(),
            [GatewayEvent::VoiceJoined { .. }]
        ));
        assert_eq!(state.voice.active_channel(USER), Some(CHANNEL_B));
        // The old room emptied out and was destroyed.
        assert!(state.voice.get_room(CHANNEL_A).is_none());
    }

    #[tokio::test]
    async fn rejoining_the_same_channel_is_rejected() {
        let state = test_state().await;
        let session = test_session(&state);

        dispatch_op(
            &state,
            &session,
            ClientOp::VoiceJoin {
                channel_id: CHANNEL_A,
            },
        )
        .await;
        let events = dispatch_op(
            &state,
            &session,
            ClientOp::VoiceJoin {
                channel_id: CHANNEL_A,
            },
        )
        .await;
        assert!(matches!(
            events.as_slice(),
            [GatewayEvent::OpError {
                code: ErrorCode::AlreadyJoined,
                ..
            }]
        ));
        // The existing session is untouched.
        assert_eq!(state.voice.active_channel(USER), Some(CHANNEL_A));
    }

    #[tokio::test]
    async fn connection_slots_are_capped_and_released() {
        let mut state = test_state().await;
        state.limits.max_connections = 2;

        assert!(try_acquire_connection_slot(&state));
        assert!(try_acquire_connection_slot(&state));
        assert!(!try_acquire_connection_slot(&state));

        // Dropping a guard frees its slot for the next socket.
        drop(ConnectionGuard {
            state: state.clone(),
            acquired: true,
        });
        assert!(try_acquire_connection_slot(&state));
    }

    #[tokio::test]
    async fn cleanup_of_another_device_leaves_voice_intact() {
        let state = test_state().await;
        let voice_session = test_session(&state);
        let idle_session = test_session(&state);

        dispatch_op(
            &state,
            &voice_session,
            ClientOp::VoiceJoin {
                channel_id: CHANNEL_A,
            },
        )
        .await;
        assert_eq!(state.voice.active_channel(USER), Some(CHANNEL_A));

        // The user's second device disconnects; the first device's voice
        // session must survive.
        cleanup(&state, &idle_session).await;
        assert_eq!(state.voice.active_channel(USER), Some(CHANNEL_A));
        assert!(state.voice.get_room(CHANNEL_A).is_some());

        cleanup(&state, &voice_session).await;
        assert_eq!(state.voice.active_channel(USER), None);
    }

    #[tokio::test]
    async fn voice_ops_against_no_room_are_not_found() {
        let state = test_state().await;
        let session = test_session(&state);

        let events = dispatch_op(
            &state,
            &session,
            ClientOp::VoiceProduce {
                channel_id: CHANNEL_A,
                transport_id: "t".to_string(),
                producer_type: ProducerType::Audio,
                rtp_parameters: serde_json::json!({}),
            },
        )
        .await;
        assert!(matches!(
            events.as_slice(),
            [GatewayEvent::OpError {
                code: ErrorCode::NotFound,
                ..
            }]
        ));
    }
}
