mod handler;
mod session;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use filament_core::{
    Authenticator, ConnectionRegistry, FanoutAdapter, MembershipStore, PresenceTracker,
    TypingTracker,
};
use filament_media::WorkerPool;

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 41_250;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 90_000;
pub const DEFAULT_MAX_CONNECTIONS: usize = 2_000;

/// Per-process gateway limits and timings, fixed at startup.
#[derive(Clone, Copy)]
pub struct GatewayLimits {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub identify_timeout: Duration,
    pub max_connections: usize,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            identify_timeout: Duration::from_secs(30),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

/// Everything a gateway connection needs, shared across all sessions.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<ConnectionRegistry>,
    pub fanout: Arc<FanoutAdapter>,
    pub presence: Arc<PresenceTracker>,
    pub typing: Arc<TypingTracker>,
    pub voice: Arc<WorkerPool>,
    pub membership: Arc<dyn MembershipStore>,
    pub auth: Arc<dyn Authenticator>,
    pub limits: GatewayLimits,
    active_connections: Arc<AtomicUsize>,
}

impl GatewayState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        fanout: Arc<FanoutAdapter>,
        presence: Arc<PresenceTracker>,
        typing: Arc<TypingTracker>,
        voice: Arc<WorkerPool>,
        membership: Arc<dyn MembershipStore>,
        auth: Arc<dyn Authenticator>,
        limits: GatewayLimits,
    ) -> Self {
        Self {
            registry,
            fanout,
            presence,
            typing,
            voice,
            membership,
            auth,
            limits,
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }
}

pub fn gateway_router() -> Router<GatewayState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_connection(socket, state))
}
