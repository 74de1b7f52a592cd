use filament_core::ConnectionId;
use filament_models::Id;

pub struct Session {
    pub conn_id: ConnectionId,
    pub user_id: Id,
    pub session_id: String,
}

impl Session {
    pub fn new(conn_id: ConnectionId, user_id: Id) -> Self {
        Self {
            conn_id,
            user_id,
            session_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}
