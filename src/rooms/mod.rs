pub mod msg;
mod new;
mod ws;

use axum::{routing::{get, post}, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/new", post(new::new_room))
        .route("/ws", get(ws::room_ws))
}
