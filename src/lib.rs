pub mod auth;
pub mod config;
pub mod db;
pub mod hub;
pub mod rooms;
pub mod session;

use std::sync::Arc;

use axum::{Router, extract::FromRef, http::StatusCode, response::{IntoResponse, Response}};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::SameSite};

pub use hub::{Hub, HubError};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub hub: Arc<Hub>,
}

/// Builds the HTTP surface: identity stand-in plus the room endpoints.
pub fn app(state: AppState, session_idle: time::Duration) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(session_idle));

    Router::new()
        .merge(auth::router())
        .nest("/r", rooms::router())
        .with_state(state)
        .layer(session_layer)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub type AppResult<T> = Result<T, AppError>;
#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<HubError>() {
            Some(HubError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(HubError::Unauthorized(_)) => StatusCode::UNAUTHORIZED,
            Some(HubError::BadCommand(_) | HubError::NoActiveRoom) => StatusCode::BAD_REQUEST,
            Some(HubError::ConnectionClosed) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(err = %self.0, "request failed");
            return (status, format!("{}\n\n{}", self.0, self.0.backtrace())).into_response();
        }
        (status, self.0.to_string()).into_response()
    }
}

impl From<String> for AppError {
    fn from(err: String) -> Self {
        Self(anyhow::Error::msg(err))
    }
}

impl From<&str> for AppError {
    fn from(err: &str) -> Self {
        Self(anyhow::Error::msg(err.to_owned()))
    }
}

macro_rules! apperr_impl {
    ($E:ty) => {
        impl From<$E> for AppError {
            fn from(err: $E) -> Self {
                Self(anyhow::Error::from(err))
            }
        }
    };
}

apperr_impl!(HubError);
apperr_impl!(tower_sessions::session::Error);
