//! Room subscription multiplexing and group fan-out.
//!
//! ```text
//!  ConnectionSession ──join/leave──▶ PresenceBroadcaster ──▶ room_<id> members
//!        │
//!        └─create_message──▶ Datastore ──Message──▶ EventRouter<MessageActivity>
//!                                                     │ groups_for_signal
//!                                                     ▼
//!                                                GroupRegistry
//!                                                     │ members
//!                                                     ▼
//!                                      groups_for_consumer + request id
//!                                                     │
//!                                                     ▼
//!                                             Connection outbox
//! ```

pub mod error;
pub mod group;
pub mod observer;
pub mod payload;
pub mod presence;
pub mod session;
pub mod store;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::db::{Message, RoomId, User};

pub use error::{HubError, HubResult};
pub use group::{ConnectionId, Group, GroupRegistry};
pub use observer::{EventRouter, Fanout, MessageActivity, Observer};
pub use payload::{Action, Outbox};
pub use presence::PresenceBroadcaster;
pub use session::{Connection, ConnectionSession, Interests, RequestId};
pub use store::{Datastore, MemoryStore};

pub struct Hub {
    store: Arc<dyn Datastore>,
    registry: Arc<GroupRegistry>,
    connections: Arc<DashMap<ConnectionId, Arc<Connection>>>,
    messages: EventRouter<MessageActivity>,
    presence: PresenceBroadcaster,
    outbound_buffer: usize,
}

impl Hub {
    pub fn new(store: Arc<dyn Datastore>, outbound_buffer: usize) -> Arc<Self> {
        let registry = Arc::new(GroupRegistry::new());
        let connections = Arc::new(DashMap::new());
        Arc::new(Self {
            messages: EventRouter::new(MessageActivity, registry.clone(), connections.clone()),
            presence: PresenceBroadcaster::new(
                store.clone(),
                registry.clone(),
                connections.clone(),
            ),
            store,
            registry,
            connections,
            outbound_buffer,
        })
    }

    pub fn store(&self) -> &Arc<dyn Datastore> {
        &self.store
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Attaches an authenticated user.
    ///
    /// Returns the session driving the connection and the receiving end of
    /// its outbound stream, which the transport drains.
    pub fn connect(self: &Arc<Self>, user: User) -> (ConnectionSession, mpsc::Receiver<String>) {
        let (outbox, rx) = Outbox::channel(self.outbound_buffer);
        let conn = Arc::new(Connection::new(Uuid::now_v7(), user, outbox));
        self.connections.insert(conn.id(), conn.clone());
        info!(connection = %conn.id(), user = %conn.user().id, "connection attached");
        (ConnectionSession::new(self.clone(), conn), rx)
    }

    /// Publishes a message mutation made outside a connection session.
    pub async fn notify_message(&self, message: &Message, action: Action) -> Fanout {
        self.messages.dispatch(message, action).await
    }

    /// Re-sends a room's roster to its members.
    pub async fn broadcast_presence(&self, room: RoomId) -> HubResult<usize> {
        self.presence.broadcast(room).await
    }
}
