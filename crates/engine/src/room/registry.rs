use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::{Outbound, Room};

/// Process-wide map of live rooms, keyed by session id. Rooms are
/// created lazily and dropped when their last presence leaves or the
/// session ends.
#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_create(&self, session_id: Uuid) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&session_id) {
                return Arc::clone(room);
            }
        }

        let mut rooms = self.rooms.write().await;
        Arc::clone(
            rooms.entry(session_id).or_insert_with(|| {
                debug!(session_id = %session_id, "created room");
                Arc::new(Room::new(session_id))
            }),
        )
    }

    pub async fn get(&self, session_id: Uuid) -> Option<Arc<Room>> {
        let rooms = self.rooms.read().await;
        rooms.get(&session_id).map(Arc::clone)
    }

    /// Drops the room unconditionally and asks its connections to
    /// close. Used when a session ends. The room is sealed before the
    /// registry lock is released, so a handle obtained earlier cannot
    /// attach a connection to the removed room.
    pub async fn remove(&self, session_id: Uuid) {
        let senders = {
            let mut rooms = self.rooms.write().await;
            match rooms.remove(&session_id) {
                Some(room) => {
                    debug!(session_id = %session_id, "removed room");
                    room.seal().await
                }
                None => return,
            }
        };

        for sender in senders {
            let _ = sender.send(Outbound::Close);
        }
    }

    /// Drops the room only if it holds no presences. Returns whether a
    /// room was dropped. Called after a disconnect empties a room.
    /// Sealing happens under the registry write lock; a connection that
    /// already fetched this room sees its `join` refused and retries
    /// through `get_or_create`.
    pub async fn drop_if_empty(&self, session_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(&session_id) else {
            return false;
        };

        if !room.seal_if_empty().await {
            return false;
        }

        rooms.remove(&session_id);
        debug!(session_id = %session_id, "dropped empty room");
        true
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}
