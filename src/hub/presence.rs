use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::db::RoomId;

use super::error::HubResult;
use super::group::{ConnectionId, Group, GroupRegistry};
use super::payload::Presence;
use super::session::Connection;
use super::store::Datastore;

/// Pushes a room's current roster to everyone in the room group.
///
/// Unlike message activity this is not request-id scoped: every member of
/// `room_<id>` gets the same payload, subscribed or not.
pub struct PresenceBroadcaster {
    store: Arc<dyn Datastore>,
    registry: Arc<GroupRegistry>,
    connections: Arc<DashMap<ConnectionId, Arc<Connection>>>,
}

impl PresenceBroadcaster {
    pub fn new(
        store: Arc<dyn Datastore>,
        registry: Arc<GroupRegistry>,
        connections: Arc<DashMap<ConnectionId, Arc<Connection>>>,
    ) -> Self {
        Self {
            store,
            registry,
            connections,
        }
    }

    /// Returns how many connections the roster was queued on.
    pub async fn broadcast(&self, room: RoomId) -> HubResult<usize> {
        let users = self.store.list_current_users(room).await?;
        let payload = serde_json::to_string(&Presence { users: &users })?;

        let delivered = self
            .registry
            .members(&Group::Room(room))
            .into_iter()
            .filter_map(|id| self.connections.get(&id).map(|c| c.value().clone()))
            .filter(|conn| conn.deliver(payload.clone()))
            .count();

        debug!(room, users = users.len(), delivered, "presence broadcast");
        Ok(delivered)
    }
}
