//! Session-backed identity.
//!
//! Real authentication happens elsewhere; `/login` only records which user
//! the browser session belongs to.

use axum::{Router, debug_handler, extract::{Query, State}, response::Redirect, routing::get};
use serde::Deserialize;
use std::sync::Arc;
use tower_sessions::Session;
use tracing::info;

use crate::db::User;
use crate::hub::{Datastore, Hub, HubError};
use crate::session::{RETURN_URL, USER_ID};
use crate::{AppResult, AppState};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/login", get(login))
        .route("/logout", get(logout))
}

#[derive(Deserialize)]
pub(crate) struct LoginQuery {
    pub(crate) user_id: String,
    pub(crate) return_url: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct LogoutQuery {
    pub(crate) return_url: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn login(
    Query(LoginQuery { user_id, return_url }): Query<LoginQuery>,
    State(hub): State<Arc<Hub>>,
    session: Session,
) -> AppResult<Redirect> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(HubError::unauthorized("empty user id").into());
    }

    let user = hub.store().ensure_user(user_id).await?;
    session.insert(USER_ID, &user.id).await?;
    info!(user = %user.id, alias = %user.alias, "logged in");

    let return_url = match return_url {
        Some(url) => url,
        None => session.remove::<String>(RETURN_URL).await?.unwrap_or("/".to_owned()),
    };
    Ok(Redirect::to(&return_url))
}

#[debug_handler]
pub(crate) async fn logout(
    Query(LogoutQuery { return_url }): Query<LogoutQuery>,
    session: Session
) -> AppResult<Redirect> {
    session.clear().await;
    Ok(Redirect::to(return_url.unwrap_or("/".to_string()).as_str()))
}

/// Resolves the user a new connection acts as.
pub async fn current_user(session: &Session, store: &dyn Datastore) -> Result<User, HubError> {
    let user_id = session
        .get::<String>(USER_ID)
        .await
        .map_err(|err| HubError::unauthorized(format!("unreadable session: {err}")))?
        .ok_or_else(|| HubError::unauthorized("no user in session"))?;
    store.ensure_user(&user_id).await
}
