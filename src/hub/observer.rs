//! Mutation fan-out.
//!
//! An [`Observer`] names the groups an entity mutation belongs to (producer
//! side) and the groups a connection currently listens on (consumer side).
//! The [`EventRouter`] composes the two with the registry.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::db::Message;

use super::error::{HubError, HubResult};
use super::group::{ConnectionId, Group, GroupRegistry};
use super::payload::{Action, Activity, MessageView, tag_with_request_id};
use super::session::{Connection, Interests};

pub trait Observer: Send + Sync {
    type Entity: Send + Sync;

    /// Groups interested in a mutation of `entity`.
    fn groups_for_signal(&self, entity: &Self::Entity) -> Vec<Group>;

    /// Groups a connection with these interests should receive events on.
    fn groups_for_consumer(&self, interests: &Interests) -> BTreeSet<Group>;

    /// Serializes the mutation once; request ids are attached per delivery.
    fn serialize(&self, entity: &Self::Entity, action: Action) -> HubResult<Value>;
}

/// Message creations, updates and deletions.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageActivity;

impl Observer for MessageActivity {
    type Entity = Message;

    fn groups_for_signal(&self, message: &Message) -> Vec<Group> {
        vec![Group::Room(message.room_id), Group::Message(message.id)]
    }

    fn groups_for_consumer(&self, interests: &Interests) -> BTreeSet<Group> {
        interests.subscriptions.keys().copied().collect()
    }

    fn serialize(&self, message: &Message, action: Action) -> HubResult<Value> {
        Ok(serde_json::to_value(Activity {
            action,
            pk: message.id.to_string(),
            data: MessageView::from(message),
        })?)
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Fanout {
    /// Payloads queued on a connection.
    pub delivered: usize,
    /// Registry members that were not actually interested.
    pub skipped: usize,
    /// Deliveries to connections that closed meanwhile or whose queue was full.
    pub dropped: usize,
}

pub struct EventRouter<O> {
    observer: O,
    registry: Arc<GroupRegistry>,
    connections: Arc<DashMap<ConnectionId, Arc<Connection>>>,
}

impl<O: Observer> EventRouter<O> {
    pub fn new(
        observer: O,
        registry: Arc<GroupRegistry>,
        connections: Arc<DashMap<ConnectionId, Arc<Connection>>>,
    ) -> Self {
        Self {
            observer,
            registry,
            connections,
        }
    }

    /// Delivers one payload per (connection, matching group) pair.
    ///
    /// Groups are processed in order and delivery never waits on a
    /// connection's queue, so a connection never sees this mutation's
    /// payloads reordered and a stalled peer cannot hold up the rest.
    /// Per-delivery problems are logged and counted; they never abort the
    /// fan-out.
    pub async fn dispatch(&self, entity: &O::Entity, action: Action) -> Fanout {
        let mut fanout = Fanout::default();
        let body = match self.observer.serialize(entity, action) {
            Ok(body) => body,
            Err(err) => {
                warn!(%err, "dropping mutation that failed to serialize");
                return fanout;
            }
        };

        for group in self.observer.groups_for_signal(entity) {
            for conn_id in self.registry.members(&group) {
                match self.prepare(&group, conn_id, &body) {
                    Ok(Some((conn, payload))) => {
                        if conn.deliver(payload) {
                            fanout.delivered += 1;
                        } else {
                            fanout.dropped += 1;
                        }
                    }
                    Ok(None) => fanout.skipped += 1,
                    Err(err) => {
                        warn!(connection = %conn_id, %group, %err, "skipping delivery");
                        fanout.skipped += 1;
                    }
                }
            }
        }
        fanout
    }

    fn prepare(
        &self,
        group: &Group,
        conn_id: ConnectionId,
        body: &Value,
    ) -> HubResult<Option<(Arc<Connection>, String)>> {
        let Some(conn) = self.connections.get(&conn_id).map(|c| c.value().clone()) else {
            debug!(connection = %conn_id, %group, "member already detached");
            return Ok(None);
        };
        if conn.is_closed() {
            return Ok(None);
        }

        let interests = conn.interests();
        if !self.observer.groups_for_consumer(&interests).contains(group) {
            debug!(connection = %conn_id, %group, "member not subscribed to group");
            return Ok(None);
        }

        let Some(request_id) = interests.subscriptions.get(group) else {
            return Err(HubError::InvariantViolation(format!(
                "connection {conn_id} listens on {group} without a request id"
            )));
        };
        let payload = tag_with_request_id(request_id, body)?;
        Ok(Some((conn, payload)))
    }
}
