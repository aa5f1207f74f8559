use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{State, WebSocketUpgrade, ws::{Message, WebSocket}},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tower_sessions::Session;
use tracing::{debug, warn};

use crate::{auth, db::User, hub::Hub, rooms::msg::{self, Command}, AppResult};

#[debug_handler(state = crate::AppState)]
pub async fn room_ws(
    State(hub): State<Arc<Hub>>,
    session: Session,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let user = auth::current_user(&session, hub.store().as_ref()).await?;
    Ok(ws.on_upgrade(move |stream| serve(hub, user, stream)))
}

async fn serve(hub: Arc<Hub>, user: User, stream: WebSocket) {
    let (mut conn, mut rx) = hub.connect(user);
    let (mut sender, mut receiver) = stream.split();

    let mut outbound_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = &mut outbound_task => break,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                debug!(connection = %conn.id(), %err, "websocket read failed");
                break;
            }
        };

        let command = match Command::parse(text.as_str()) {
            Ok(command) => command,
            Err(err) => {
                conn.report("unknown", &err);
                continue;
            }
        };
        let action = command.name();
        if let Err(err) = msg::execute(&mut conn, command).await {
            debug!(connection = %conn.id(), action, %err, "command failed");
            conn.report(action, &err);
        }
    }

    if let Err(err) = conn.disconnect().await {
        warn!(connection = %conn.id(), %err, "disconnect cleanup incomplete");
    }
    outbound_task.abort();
}
