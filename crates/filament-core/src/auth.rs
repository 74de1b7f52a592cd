use async_trait::async_trait;
use dashmap::DashMap;
use filament_models::Id;

/// The authentication layer supplies the user id for each accepted
/// connection; the gateway trusts the result. The full application plugs a
/// JWT validator in here.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Option<Id>;
}

/// Token → user lookup table for tests and development.
#[derive(Default)]
pub struct StaticTokenAuth {
    tokens: DashMap<String, Id>,
}

impl StaticTokenAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: &str, user_id: Id) {
        self.tokens.insert(token.to_string(), user_id);
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuth {
    async fn authenticate(&self, token: &str) -> Option<Id> {
        self.tokens.get(token).map(|id| *id)
    }
}
