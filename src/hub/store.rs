//! The datastore seam and an in-process implementation of it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::{Message, Room, RoomId, User, UserId};

use super::error::{HubError, HubResult};

/// Persistent rooms, users and messages as seen by the hub.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Fails with [`HubError::NotFound`] if the room does not exist.
    async fn get_room(&self, id: RoomId) -> HubResult<Room>;

    async fn create_message(&self, room_id: RoomId, author_id: &str, text: &str)
    -> HubResult<Message>;

    /// Adding an existing member is a no-op.
    async fn add_user_to_room(&self, room_id: RoomId, user_id: &str) -> HubResult<()>;

    /// Removing a non-member is a no-op.
    async fn remove_user_from_room(&self, room_id: RoomId, user_id: &str) -> HubResult<()>;

    /// Current members in the order they joined.
    async fn list_current_users(&self, room_id: RoomId) -> HubResult<Vec<User>>;

    async fn create_room(&self, name: &str) -> HubResult<Room>;

    /// Looks a user up, creating it with a generated alias if unknown.
    async fn ensure_user(&self, user_id: &str) -> HubResult<User>;
}

const ADJECTIVES: [&str; 16] = [
    "Quick", "Lazy", "Mysterious", "Jolly", "Brave", "Silent", "Witty", "Fierce",
    "Clever", "Gentle", "Wild", "Calm", "Bold", "Shy", "Golden", "Lucky",
];

const NOUNS: [&str; 16] = [
    "Fox", "Bear", "Eagle", "Wolf", "Dragon", "Tiger", "Owl", "Rabbit",
    "Falcon", "Hawk", "Panda", "Phoenix", "Griffin", "Turtle", "Dolphin", "Whale",
];

pub(crate) fn random_alias() -> String {
    let mut rng = rand::rng();
    format!(
        "{} {}",
        ADJECTIVES.choose(&mut rng).copied().unwrap_or("Nameless"),
        NOUNS.choose(&mut rng).copied().unwrap_or("User"),
    )
}

struct RoomRecord {
    name: String,
    members: Vec<UserId>,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<UserId, User>,
    rooms: BTreeMap<RoomId, RoomRecord>,
    messages: Vec<Message>,
    next_room: RoomId,
}

impl MemoryState {
    fn room(&self, id: RoomId) -> HubResult<&RoomRecord> {
        self.rooms
            .get(&id)
            .ok_or_else(|| HubError::not_found(format!("room {id}")))
    }

    fn room_mut(&mut self, id: RoomId) -> HubResult<&mut RoomRecord> {
        self.rooms
            .get_mut(&id)
            .ok_or_else(|| HubError::not_found(format!("room {id}")))
    }

    fn user(&self, id: &str) -> User {
        self.users.get(id).cloned().unwrap_or_else(|| User {
            id: id.to_owned(),
            alias: id.to_owned(),
        })
    }
}

/// Keeps everything in memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a user with a fixed alias.
    pub fn insert_user(&self, user: User) {
        self.lock().users.insert(user.id.clone(), user);
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    async fn get_room(&self, id: RoomId) -> HubResult<Room> {
        let state = self.lock();
        let room = state.room(id)?;
        Ok(Room {
            id,
            name: room.name.clone(),
            members: room.members.clone(),
        })
    }

    async fn create_message(
        &self,
        room_id: RoomId,
        author_id: &str,
        text: &str,
    ) -> HubResult<Message> {
        let mut state = self.lock();
        state.room(room_id)?;
        let message = Message {
            id: Uuid::now_v7(),
            room_id,
            user_id: author_id.to_owned(),
            text: text.to_owned(),
            created_at: OffsetDateTime::now_utc(),
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn add_user_to_room(&self, room_id: RoomId, user_id: &str) -> HubResult<()> {
        let mut state = self.lock();
        let room = state.room_mut(room_id)?;
        if !room.members.iter().any(|m| m == user_id) {
            room.members.push(user_id.to_owned());
        }
        Ok(())
    }

    async fn remove_user_from_room(&self, room_id: RoomId, user_id: &str) -> HubResult<()> {
        let mut state = self.lock();
        state.room_mut(room_id)?.members.retain(|m| m != user_id);
        Ok(())
    }

    async fn list_current_users(&self, room_id: RoomId) -> HubResult<Vec<User>> {
        let state = self.lock();
        let room = state.room(room_id)?;
        Ok(room.members.iter().map(|id| state.user(id)).collect())
    }

    async fn create_room(&self, name: &str) -> HubResult<Room> {
        let mut state = self.lock();
        state.next_room += 1;
        let id = state.next_room;
        state.rooms.insert(
            id,
            RoomRecord {
                name: name.to_owned(),
                members: Vec::new(),
            },
        );
        Ok(Room {
            id,
            name: name.to_owned(),
            members: Vec::new(),
        })
    }

    async fn ensure_user(&self, user_id: &str) -> HubResult<User> {
        let mut state = self.lock();
        let user = state
            .users
            .entry(user_id.to_owned())
            .or_insert_with(|| User {
                id: user_id.to_owned(),
                alias: random_alias(),
            });
        Ok(user.clone())
    }
}
