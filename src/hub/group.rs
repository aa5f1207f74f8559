//! Routing keys and the registry mapping them to live connections.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use uuid::Uuid;

use crate::db::{MessageId, RoomId};

use super::error::HubError;

pub type ConnectionId = Uuid;

/// A derived routing key. Never stored, always computed from domain facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Group {
    /// Everyone interested in a room.
    Room(RoomId),
    /// Everyone interested in one specific message.
    Message(MessageId),
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Group::Room(id) => write!(f, "room_{id}"),
            Group::Message(id) => write!(f, "message_{id}"),
        }
    }
}

impl FromStr for Group {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(id) = s.strip_prefix("room_") {
            return id
                .parse()
                .map(Group::Room)
                .map_err(|_| HubError::bad_command(format!("bad room id in group {s:?}")));
        }
        if let Some(id) = s.strip_prefix("message_") {
            return Uuid::parse_str(id)
                .map(Group::Message)
                .map_err(|_| HubError::bad_command(format!("bad message id in group {s:?}")));
        }
        Err(HubError::bad_command(format!("unknown group {s:?}")))
    }
}

#[derive(Default)]
struct Memberships {
    groups: HashMap<Group, BTreeSet<ConnectionId>>,
    by_connection: HashMap<ConnectionId, HashSet<Group>>,
}

impl Memberships {
    fn remove(&mut self, group: &Group, conn: ConnectionId) -> bool {
        let Some(members) = self.groups.get_mut(group) else {
            return false;
        };
        let removed = members.remove(&conn);
        if members.is_empty() {
            self.groups.remove(group);
        }
        removed
    }
}

/// Group name -> interested connections.
///
/// Both directions live behind one lock so `leave_all` is observed as a
/// single step by concurrent `members` lookups.
#[derive(Default)]
pub struct GroupRegistry {
    inner: RwLock<Memberships>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the connection was not already a member.
    pub fn join(&self, group: Group, conn: ConnectionId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.by_connection.entry(conn).or_default().insert(group);
        inner.groups.entry(group).or_default().insert(conn)
    }

    /// Returns `true` if the connection was a member.
    pub fn leave(&self, group: &Group, conn: ConnectionId) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(groups) = inner.by_connection.get_mut(&conn) {
            groups.remove(group);
            if groups.is_empty() {
                inner.by_connection.remove(&conn);
            }
        }
        inner.remove(group, conn)
    }

    /// Removes the connection from every group it is in and returns those groups.
    pub fn leave_all(&self, conn: ConnectionId) -> Vec<Group> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(groups) = inner.by_connection.remove(&conn) else {
            return Vec::new();
        };
        let mut left: Vec<Group> = groups.into_iter().collect();
        left.sort();
        for group in &left {
            inner.remove(group, conn);
        }
        left
    }

    /// Snapshot of the current members, in connection id order.
    pub fn members(&self, group: &Group) -> Vec<ConnectionId> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .groups
            .get(group)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_member(&self, group: &Group, conn: ConnectionId) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .groups
            .get(group)
            .is_some_and(|members| members.contains(&conn))
    }

    pub fn groups_of(&self, conn: ConnectionId) -> Vec<Group> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut groups: Vec<Group> = inner
            .by_connection
            .get(&conn)
            .map(|groups| groups.iter().copied().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }

    pub fn group_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .groups
            .len()
    }
}
