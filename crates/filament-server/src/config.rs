use anyhow::Result;
use serde::Deserialize;
use std::fs;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub typing: TypingConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
    #[serde(default)]
    pub roster: RosterConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub backend: BrokerBackend,
    #[serde(default = "default_broker_url")]
    pub url: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            url: default_broker_url(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    /// Single-process in-memory broker; no external service needed.
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_identify_timeout_secs")]
    pub identify_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            identify_timeout_secs: default_identify_timeout_secs(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_presence_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_presence_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TypingConfig {
    #[serde(default = "default_typing_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_typing_ttl_secs(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfig {
    /// Media workers to spawn; 0 means one per core, capped at four.
    #[serde(default)]
    pub worker_count: usize,
}

/// Static membership roster. The gateway resolves users, tokens, server
/// membership, and channel ownership through a trait; this file-backed
/// roster is the deployment without an application database behind it.
#[derive(Debug, Default, Deserialize)]
pub struct RosterConfig {
    #[serde(default)]
    pub users: Vec<RosterUser>,
    #[serde(default)]
    pub channels: Vec<RosterChannel>,
}

#[derive(Debug, Deserialize)]
pub struct RosterUser {
    pub id: i64,
    pub username: String,
    pub token: String,
    #[serde(default)]
    pub servers: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RosterChannel {
    pub id: i64,
    pub server_id: i64,
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".into()
}

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379".into()
}

fn default_heartbeat_interval_ms() -> u64 {
    filament_gateway::DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_heartbeat_timeout_ms() -> u64 {
    filament_gateway::DEFAULT_HEARTBEAT_TIMEOUT_MS
}

fn default_identify_timeout_secs() -> u64 {
    30
}

fn default_max_connections() -> usize {
    filament_gateway::DEFAULT_MAX_CONNECTIONS
}

fn default_presence_ttl_secs() -> u64 {
    90
}

fn default_typing_ttl_secs() -> u64 {
    10
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config: Config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::info!("config file not found at '{path}', using defaults");
            Config::default()
        };

        // Environment variable overrides
        if let Ok(value) = std::env::var("FILAMENT_BIND_ADDRESS") {
            config.server.bind_address = value;
        }
        if let Ok(value) = std::env::var("FILAMENT_BROKER_URL") {
            config.broker.url = value;
            config.broker.backend = BrokerBackend::Redis;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert_eq!(config.broker.backend, BrokerBackend::Memory);
        assert_eq!(config.presence.ttl_secs, 90);
        assert_eq!(config.typing.ttl_secs, 10);
        assert_eq!(config.voice.worker_count, 0);
        assert!(config.roster.users.is_empty());
    }

    #[test]
    fn roster_entries_parse() {
        let raw = r#"
            [broker]
            backend = "redis"
            url = "redis://cache:6379"

            [[roster.users]]
            id = 1
            username = "alice"
            token = "alice-token"
            servers = [10, 11]

            [[roster.channels]]
            id = 100
            server_id = 10
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.broker.backend, BrokerBackend::Redis);
        assert_eq!(config.roster.users.len(), 1);
        assert_eq!(config.roster.users[0].servers, vec![10, 11]);
        assert_eq!(config.roster.channels[0].server_id, 10);
    }
}
