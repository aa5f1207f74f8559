//! Wire payloads and the per-connection outbound queue.

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::db::{Message, MessageId, RoomId, User};

use super::error::HubError;

/// What happened to an observed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    #[serde(rename = "create")]
    Created,
    #[serde(rename = "update")]
    Updated,
    #[serde(rename = "delete")]
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub id: MessageId,
    pub room: RoomId,
    pub user: String,
    pub text: String,
    pub html: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<&Message> for MessageView {
    fn from(message: &Message) -> Self {
        let mut html = String::new();
        pulldown_cmark::html::push_html(&mut html, pulldown_cmark::Parser::new(&message.text));

        Self {
            id: message.id,
            room: message.room_id,
            user: message.user_id.clone(),
            text: message.text.clone(),
            html,
            created_at: message.created_at,
        }
    }
}

/// Body shared by every delivery of one mutation, before request ids are attached.
#[derive(Debug, Serialize)]
pub struct Activity<T> {
    pub action: Action,
    pub pk: String,
    pub data: T,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Tagged<'a> {
    request_id: &'a str,
    #[serde(flatten)]
    body: &'a Value,
}

/// Attaches a subscriber's request id to a serialized activity body.
pub fn tag_with_request_id(request_id: &str, body: &Value) -> Result<String, HubError> {
    Ok(serde_json::to_string(&Tagged { request_id, body })?)
}

#[derive(Debug, Serialize)]
pub struct Presence<'a> {
    pub users: &'a [User],
}

#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub kind: &'static str,
    pub message: String,
    pub action: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ErrorFrame<'a> {
    pub error: ErrorBody<'a>,
}

impl<'a> ErrorFrame<'a> {
    pub fn new(action: &'a str, err: &HubError) -> Self {
        Self {
            error: ErrorBody {
                kind: err.kind(),
                message: err.to_string(),
                action,
            },
        }
    }
}

/// Sending half of a connection's outbound stream.
///
/// Payloads are already serialized; the transport forwards them verbatim.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<String>,
}

impl Outbox {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queues a payload without waiting for capacity.
    pub fn deliver(&self, payload: String) -> Result<(), TrySendError<String>> {
        self.tx.try_send(payload)
    }
}
