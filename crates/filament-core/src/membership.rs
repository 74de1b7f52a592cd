use async_trait::async_trait;
use dashmap::DashMap;
use filament_models::Id;

/// External membership lookup (backed by the relational store in the full
/// application). The core only needs two questions answered: which servers
/// a user belongs to (presence fan-out targets) and which server owns a
/// channel (typing routing).
#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn server_ids_for_user(&self, user_id: Id) -> Vec<Id>;
    async fn server_for_channel(&self, channel_id: Id) -> Option<Id>;
    async fn username(&self, user_id: Id) -> Option<String>;
}

/// In-memory membership table, used by tests and the standalone server
/// binary's seed data.
#[derive(Default)]
pub struct StaticMembership {
    members: DashMap<Id, Vec<Id>>,
    channels: DashMap<Id, Id>,
    usernames: DashMap<Id, String>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, user_id: Id, server_id: Id) {
        let mut servers = self.members.entry(user_id).or_default();
        if !servers.contains(&server_id) {
            servers.push(server_id);
        }
    }

    pub fn add_channel(&self, channel_id: Id, server_id: Id) {
        self.channels.insert(channel_id, server_id);
    }

    pub fn add_user(&self, user_id: Id, username: &str) {
        self.usernames.insert(user_id, username.to_string());
    }
}

#[async_trait]
impl MembershipStore for StaticMembership {
    async fn server_ids_for_user(&self, user_id: Id) -> Vec<Id> {
        self.members
            .get(&user_id)
            .map(|servers| servers.clone())
            .unwrap_or_default()
    }

    async fn server_for_channel(&self, channel_id: Id) -> Option<Id> {
        self.channels.get(&channel_id).map(|server| *server)
    }

    async fn username(&self, user_id: Id) -> Option<String> {
        self.usernames.get(&user_id).map(|name| name.clone())
    }
}
