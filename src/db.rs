use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::hub::store::random_alias;
use crate::hub::{Datastore, HubError, HubResult};

pub type RoomId = i64;
pub type MessageId = Uuid;
pub type UserId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: UserId,
    pub alias: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    /// Ids of the users currently present.
    pub members: Vec<UserId>,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub text: String,
    pub created_at: OffsetDateTime,
}

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        alias TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS rooms (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL
    )",
    // rowid keeps join order for presence listings
    "CREATE TABLE IF NOT EXISTS room_members (
        room_id INTEGER NOT NULL,
        user_id TEXT NOT NULL,
        PRIMARY KEY (room_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id TEXT PRIMARY KEY,
        room_id INTEGER NOT NULL,
        user_id TEXT NOT NULL,
        text TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
];

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        // every connection to :memory: is its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 16 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("creating schema")?;
        }
        Ok(())
    }
}

#[async_trait]
impl Datastore for SqliteStore {
    async fn get_room(&self, id: RoomId) -> HubResult<Room> {
        let Some((name,)): Option<(String,)> = sqlx::query_as("SELECT name FROM rooms WHERE id=?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Err(HubError::not_found(format!("room {id}")));
        };

        let members: Vec<(String,)> =
            sqlx::query_as("SELECT user_id FROM room_members WHERE room_id=? ORDER BY rowid")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        Ok(Room {
            id,
            name,
            members: members.into_iter().map(|(user_id,)| user_id).collect(),
        })
    }

    async fn create_message(
        &self,
        room_id: RoomId,
        author_id: &str,
        text: &str,
    ) -> HubResult<Message> {
        self.get_room(room_id).await?;

        let message = Message {
            id: Uuid::now_v7(),
            room_id,
            user_id: author_id.to_owned(),
            text: text.to_owned(),
            created_at: OffsetDateTime::now_utc(),
        };
        sqlx::query("INSERT INTO messages (id,room_id,user_id,text,created_at) VALUES (?,?,?,?,?)")
            .bind(message.id.to_string())
            .bind(room_id)
            .bind(author_id)
            .bind(text)
            .bind(message.created_at.format(&Rfc3339)?)
            .execute(&self.pool)
            .await?;

        Ok(message)
    }

    async fn add_user_to_room(&self, room_id: RoomId, user_id: &str) -> HubResult<()> {
        self.get_room(room_id).await?;
        sqlx::query("INSERT OR IGNORE INTO room_members (room_id,user_id) VALUES (?,?)")
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove_user_from_room(&self, room_id: RoomId, user_id: &str) -> HubResult<()> {
        sqlx::query("DELETE FROM room_members WHERE room_id=? AND user_id=?")
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_current_users(&self, room_id: RoomId) -> HubResult<Vec<User>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT m.user_id, COALESCE(u.alias, m.user_id)
             FROM room_members m LEFT JOIN users u ON u.id = m.user_id
             WHERE m.room_id=? ORDER BY m.rowid",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, alias)| User { id, alias })
            .collect())
    }

    async fn create_room(&self, name: &str) -> HubResult<Room> {
        let id: RoomId = sqlx::query_scalar("INSERT INTO rooms (name) VALUES (?) RETURNING id")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(Room {
            id,
            name: name.to_owned(),
            members: Vec::new(),
        })
    }

    async fn ensure_user(&self, user_id: &str) -> HubResult<User> {
        sqlx::query("INSERT OR IGNORE INTO users (id,alias) VALUES (?,?)")
            .bind(user_id)
            .bind(random_alias())
            .execute(&self.pool)
            .await?;

        let (alias,): (String,) = sqlx::query_as("SELECT alias FROM users WHERE id=?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(User {
            id: user_id.to_owned(),
            alias,
        })
    }
}
