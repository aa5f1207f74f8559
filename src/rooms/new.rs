use std::sync::Arc;

use axum::{debug_handler, extract::State, Json};
use serde::Deserialize;
use tower_sessions::Session;
use tracing::info;

use crate::{db::Room, hub::{Datastore, Hub, HubError}, session::USER_ID, AppResult, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct NewRoomQuery {
    name: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn new_room(
    State(hub): State<Arc<Hub>>,
    session: Session,

    Json(NewRoomQuery { name }): Json<NewRoomQuery>,
) -> AppResult<Json<Room>> {
    let Some(user_id) = session.get::<String>(USER_ID).await? else {
        return Err(HubError::unauthorized("log in to create rooms").into());
    };

    let name = name.trim();
    if name.is_empty() {
        return Err(HubError::bad_command("room name is empty").into());
    }

    let room = hub.store().create_room(name).await?;
    info!(room = room.id, name = %room.name, user = %user_id, "room created");
    Ok(Json(room))
}
