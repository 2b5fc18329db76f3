use serde::{Deserialize, Serialize};

/// One unit of backfill work: fetch the history page that `token` points at
/// for `room_id`.
///
/// At most one task exists per (server, user, room) at any time, across the
/// durable store and the in-memory queue combined. The token is always a
/// cursor the homeserver previously returned, either a `prev_batch` bounding
/// a sync gap or the `end` of an earlier history page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchTask {
    /// Opaque room identifier.
    pub room_id: String,
    /// Opaque, server-issued pagination cursor into the room's history.
    pub token: String,
}

impl FetchTask {
    pub fn new(room_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            token: token.into(),
        }
    }
}

/// The (server, user, device) triple identifying one engine instance.
///
/// Used as the persistence key for every fetch task belonging to the
/// session. Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Configured name of the homeserver this session talks to.
    pub server_name: String,
    /// Fully qualified user identifier.
    pub user_id: String,
    /// Device identifier assigned at login.
    pub device_id: String,
}

impl SessionIdentity {
    pub fn new(
        server_name: impl Into<String>,
        user_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            user_id: user_id.into(),
            device_id: device_id.into(),
        }
    }
}
