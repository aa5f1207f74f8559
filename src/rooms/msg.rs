//! Commands a client sends over its websocket.

use serde::Deserialize;

use crate::db::RoomId;
use crate::hub::{ConnectionSession, Group, HubError, HubResult};

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    JoinRoom { pk: RoomId },
    LeaveRoom { pk: RoomId },
    CreateMessage { message: String },
    Subscribe { group: String, request_id: String },
    SubscribeMessagesToRoom { pk: RoomId, request_id: String },
    Unsubscribe { group: String },
}

impl Command {
    pub fn parse(text: &str) -> HubResult<Self> {
        serde_json::from_str(text).map_err(|err| HubError::bad_command(err.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::JoinRoom { .. } => "join_room",
            Command::LeaveRoom { .. } => "leave_room",
            Command::CreateMessage { .. } => "create_message",
            Command::Subscribe { .. } => "subscribe",
            Command::SubscribeMessagesToRoom { .. } => "subscribe_messages_to_room",
            Command::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

pub(crate) async fn execute(session: &mut ConnectionSession, command: Command) -> HubResult<()> {
    match command {
        Command::JoinRoom { pk } => session.join_room(pk).await,
        Command::LeaveRoom { pk } => session.leave_room(pk).await,
        Command::CreateMessage { message } => session.create_message(&message).await.map(|_| ()),
        Command::Subscribe { group, request_id } => {
            let group: Group = group.parse()?;
            session.subscribe(group, request_id).await.map(|_| ())
        }
        Command::SubscribeMessagesToRoom { pk, request_id } => {
            session.subscribe_messages_to_room(pk, request_id).await.map(|_| ())
        }
        Command::Unsubscribe { group } => {
            let group: Group = group.parse()?;
            session.unsubscribe(group).await.map(|_| ())
        }
    }
}
