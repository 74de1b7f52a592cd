use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use filament_core::{
    Authenticator, Broker, ConnectionRegistry, FanoutAdapter, MemoryBroker, MemoryBrokerHub,
    MembershipStore, PresenceTracker, RedisBroker, StaticMembership, StaticTokenAuth,
    TypingTracker,
};
use filament_gateway::{gateway_router, GatewayLimits, GatewayState};
use filament_media::{recommended_worker_count, LocalMediaEngine, WorkerPool};

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("filament=info")),
        )
        .init();

    let args = cli::Args::parse();
    let config = config::Config::load(&args.config)?;

    let broker: Arc<dyn Broker> = match config.broker.backend {
        config::BrokerBackend::Memory => {
            tracing::info!("using in-memory broker (single-process mode)");
            let hub = MemoryBrokerHub::new();
            Arc::new(MemoryBroker::connect(&hub))
        }
        config::BrokerBackend::Redis => {
            tracing::info!("connecting to redis broker");
            Arc::new(RedisBroker::connect(&config.broker.url).await?)
        }
    };

    let registry = Arc::new(ConnectionRegistry::new());
    let fanout = FanoutAdapter::new(broker.clone(), registry.clone());
    tokio::spawn(fanout.clone().run());

    let (membership, auth) = build_roster(&config.roster);

    let presence = Arc::new(PresenceTracker::new(
        broker.clone(),
        fanout.clone(),
        registry.clone(),
        membership.clone(),
        Duration::from_secs(config.presence.ttl_secs),
    ));
    let typing = Arc::new(TypingTracker::new(
        broker,
        fanout.clone(),
        membership.clone(),
        Duration::from_secs(config.typing.ttl_secs),
    ));

    let worker_count = match config.voice.worker_count {
        0 => recommended_worker_count(),
        n => n,
    };
    let voice = WorkerPool::init(LocalMediaEngine::new(), fanout.clone(), worker_count)
        .await
        .map_err(|err| anyhow::anyhow!("media worker pool init failed: {err}"))?;

    let limits = GatewayLimits {
        heartbeat_interval: Duration::from_millis(config.gateway.heartbeat_interval_ms),
        heartbeat_timeout: Duration::from_millis(config.gateway.heartbeat_timeout_ms),
        identify_timeout: Duration::from_secs(config.gateway.identify_timeout_secs),
        max_connections: config.gateway.max_connections,
    };

    let state = GatewayState::new(
        registry,
        fanout,
        presence,
        typing,
        voice.clone(),
        membership,
        auth,
        limits,
    );

    let app = gateway_router().with_state(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(
        bind_address = %config.server.bind_address,
        workers = worker_count,
        "filament gateway listening"
    );

    let shutdown_pool = voice.clone();
    let shutdown_signal = async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {err}");
            return;
        }
        tracing::info!("shutting down (ctrl-c)");
        shutdown_pool.shutdown_all().await;
    };

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}

fn build_roster(
    roster: &config::RosterConfig,
) -> (Arc<dyn MembershipStore>, Arc<dyn Authenticator>) {
    let membership = Arc::new(StaticMembership::new());
    let auth = Arc::new(StaticTokenAuth::new());

    for user in &roster.users {
        membership.add_user(user.id, &user.username);
        auth.insert(&user.token, user.id);
        for server_id in &user.servers {
            membership.add_member(user.id, *server_id);
        }
    }
    for channel in &roster.channels {
        membership.add_channel(channel.id, channel.server_id);
    }
    tracing::info!(
        users = roster.users.len(),
        channels = roster.channels.len(),
        "roster loaded"
    );

    (membership, auth)
}
