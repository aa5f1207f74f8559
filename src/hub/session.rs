//! Per-connection state.
//!
//! A [`ConnectionSession`] is owned by the task serving one client, so its
//! `&mut self` operations run strictly in the order the client issued them.
//! The router only sees the shared [`Connection`] half.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::db::{Message, RoomId, User};

use super::Hub;
use super::error::{HubError, HubResult};
use super::group::{ConnectionId, Group};
use super::payload::{Action, ErrorFrame, Outbox};

pub type RequestId = String;

/// What a connection currently cares about, as seen by the router.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Interests {
    pub primary_room: Option<RoomId>,
    pub subscriptions: BTreeMap<Group, RequestId>,
}

/// Shared handle of a live connection.
pub struct Connection {
    id: ConnectionId,
    user: User,
    outbox: Outbox,
    interests: RwLock<Interests>,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, user: User, outbox: Outbox) -> Self {
        Self {
            id,
            user,
            outbox,
            interests: RwLock::new(Interests::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the current interests.
    pub fn interests(&self) -> Interests {
        self.interests
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queues a payload without waiting.
    ///
    /// Returns `false` when the payload was dropped: the connection is
    /// closed, its receiver is gone, or its queue is full.
    pub fn deliver(&self, payload: String) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.outbox.deliver(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection = %self.id, "outbound queue full, payload dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection = %self.id, "outbound receiver gone, payload dropped");
                false
            }
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut Interests) -> R) -> R {
        let mut interests = self.interests.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut interests)
    }

    #[cfg(test)]
    pub(crate) fn subscribe_for_test(&self, group: Group, request_id: &str) {
        self.update(|i| i.subscriptions.insert(group, request_id.to_owned()));
    }

    /// Marks the connection closed. Returns `false` if it already was.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Driver for one client attachment.
pub struct ConnectionSession {
    hub: Arc<Hub>,
    conn: Arc<Connection>,
}

impl ConnectionSession {
    pub(crate) fn new(hub: Arc<Hub>, conn: Arc<Connection>) -> Self {
        Self { hub, conn }
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id
    }

    pub fn user(&self) -> &User {
        &self.conn.user
    }

    pub fn primary_room(&self) -> Option<RoomId> {
        self.conn.interests().primary_room
    }

    pub fn interests(&self) -> Interests {
        self.conn.interests()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    fn ensure_open(&self) -> HubResult<()> {
        if self.conn.is_closed() {
            return Err(HubError::ConnectionClosed);
        }
        Ok(())
    }

    /// Makes the registry agree with this connection's interests for one group.
    fn sync_group(&self, group: Group) {
        let interests = self.conn.interests();
        let subscribed = interests.subscriptions.contains_key(&group);
        let present = matches!(group, Group::Room(room) if interests.primary_room == Some(room));
        if subscribed || present {
            self.hub.registry.join(group, self.conn.id);
        } else {
            self.hub.registry.leave(&group, self.conn.id);
        }
    }

    /// Joins `room` and makes it the primary room.
    ///
    /// A different previous primary room is released as if left.
    pub async fn join_room(&mut self, room: RoomId) -> HubResult<()> {
        self.ensure_open()?;
        self.hub.store.get_room(room).await?;
        self.hub
            .store
            .add_user_to_room(room, &self.conn.user.id)
            .await?;

        let previous = self.conn.update(|i| i.primary_room.replace(room));
        self.sync_group(Group::Room(room));
        info!(
            connection = %self.conn.id,
            user = %self.conn.user.id,
            room,
            ?previous,
            "joined room"
        );

        let released = match previous {
            Some(previous) if previous != room => self.release_room(previous).await,
            _ => Ok(()),
        };
        self.hub.presence.broadcast(room).await?;
        released
    }

    pub async fn leave_room(&mut self, room: RoomId) -> HubResult<()> {
        self.ensure_open()?;
        self.hub.store.get_room(room).await?;

        self.conn.update(|i| {
            if i.primary_room == Some(room) {
                i.primary_room = None;
            }
        });
        self.release_room(room).await?;
        info!(connection = %self.conn.id, user = %self.conn.user.id, room, "left room");
        Ok(())
    }

    /// Drops presence in a room that is no longer primary and re-sends its roster.
    async fn release_room(&self, room: RoomId) -> HubResult<()> {
        self.sync_group(Group::Room(room));
        self.hub
            .store
            .remove_user_from_room(room, &self.conn.user.id)
            .await?;
        self.hub.presence.broadcast(room).await?;
        Ok(())
    }

    /// Creates a message in the primary room and fans it out.
    ///
    /// The sender gets no direct reply; it sees the message only through its
    /// own subscriptions, like everyone else.
    pub async fn create_message(&mut self, text: &str) -> HubResult<Message> {
        self.ensure_open()?;
        let room = self.primary_room().ok_or(HubError::NoActiveRoom)?;
        let message = self
            .hub
            .store
            .create_message(room, &self.conn.user.id, text)
            .await?;

        let fanout = self.hub.messages.dispatch(&message, Action::Created).await;
        debug!(message = %message.id, room, ?fanout, "message created");
        Ok(message)
    }

    /// Registers interest in `group`, tagging deliveries with `request_id`.
    ///
    /// Returns the request id this one superseded, if any.
    pub async fn subscribe(
        &mut self,
        group: Group,
        request_id: impl Into<RequestId>,
    ) -> HubResult<Option<RequestId>> {
        self.ensure_open()?;
        let request_id = request_id.into();
        let previous = self
            .conn
            .update(|i| i.subscriptions.insert(group, request_id.clone()));
        self.sync_group(group);

        match &previous {
            Some(old) => debug!(
                connection = %self.conn.id,
                %group,
                %old,
                new = %request_id,
                "subscription superseded"
            ),
            None => debug!(connection = %self.conn.id, %group, %request_id, "subscribed"),
        }
        Ok(previous)
    }

    pub async fn subscribe_messages_to_room(
        &mut self,
        room: RoomId,
        request_id: impl Into<RequestId>,
    ) -> HubResult<Option<RequestId>> {
        self.subscribe(Group::Room(room), request_id).await
    }

    /// Drops the subscription for `group`. Returns the removed request id.
    pub async fn unsubscribe(&mut self, group: Group) -> HubResult<Option<RequestId>> {
        self.ensure_open()?;
        let removed = self.conn.update(|i| i.subscriptions.remove(&group));
        self.sync_group(group);
        debug!(connection = %self.conn.id, %group, ?removed, "unsubscribed");
        Ok(removed)
    }

    /// Sends an error frame for a failed command to this connection only.
    pub fn report(&self, action: &str, err: &HubError) {
        let payload = match serde_json::to_string(&ErrorFrame::new(action, err)) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(connection = %self.conn.id, %err, "failed to serialize error frame");
                return;
            }
        };
        self.conn.deliver(payload);
    }

    /// Releases the primary room and every registry membership. Idempotent.
    ///
    /// Registry cleanup always runs, even if releasing presence fails; the
    /// datastore error is returned afterwards.
    pub async fn disconnect(&mut self) -> HubResult<()> {
        if !self.conn.close() {
            return Ok(());
        }

        let released = match self.conn.update(|i| i.primary_room.take()) {
            Some(room) => {
                let released = self.release_room(room).await;
                if let Err(err) = &released {
                    warn!(
                        connection = %self.conn.id,
                        room,
                        %err,
                        "failed to release room on disconnect"
                    );
                }
                released
            }
            None => Ok(()),
        };

        self.release();
        info!(connection = %self.conn.id, user = %self.conn.user.id, "disconnected");
        released
    }

    fn release(&self) {
        let left = self.hub.registry.leave_all(self.conn.id);
        self.hub.connections.remove(&self.conn.id);
        self.conn.update(|i| i.subscriptions.clear());
        debug!(connection = %self.conn.id, groups = left.len(), "left all groups");
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        if self.conn.close() {
            warn!(
                connection = %self.conn.id,
                room = ?self.conn.interests().primary_room,
                "session dropped without disconnect, room presence not released"
            );
            self.release();
        }
    }
}
