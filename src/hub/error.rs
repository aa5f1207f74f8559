use thiserror::Error;

pub type HubResult<T> = Result<T, HubError>;

/// Errors surfaced by hub operations.
///
/// Command-level variants go back to the issuing connection only.
/// `InvariantViolation` never leaves the router; it is logged and the
/// affected delivery is skipped.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("no active room, join a room first")]
    NoActiveRoom,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("bad command: {0}")]
    BadCommand(String),

    #[error("datastore error: {0:#}")]
    Datastore(anyhow::Error),
}

impl HubError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn bad_command(msg: impl Into<String>) -> Self {
        Self::BadCommand(msg.into())
    }

    /// Stable identifier sent on the wire with error frames.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NoActiveRoom => "no_active_room",
            Self::Unauthorized(_) => "unauthorized",
            Self::InvariantViolation(_) => "invariant_violation",
            Self::ConnectionClosed => "connection_closed",
            Self::BadCommand(_) => "bad_command",
            Self::Datastore(_) => "datastore",
        }
    }
}

macro_rules! hub_err_impl {
    ($E:ty) => {
        impl From<$E> for HubError {
            fn from(err: $E) -> Self {
                Self::Datastore(anyhow::Error::from(err))
            }
        }
    };
}

hub_err_impl!(sqlx::Error);
hub_err_impl!(time::error::Format);

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvariantViolation(format!("payload serialization failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(HubError::not_found("room 3").kind(), "not_found");
        assert_eq!(HubError::NoActiveRoom.kind(), "no_active_room");
        assert_eq!(HubError::unauthorized("no session").kind(), "unauthorized");
        assert_eq!(HubError::bad_command("eh").kind(), "bad_command");
        assert_eq!(HubError::ConnectionClosed.kind(), "connection_closed");
    }

    #[test]
    fn datastore_errors_keep_context() {
        let err = HubError::Datastore(anyhow::anyhow!("disk full").context("inserting message"));
        assert_eq!(err.to_string(), "datastore error: inserting message: disk full");
    }
}
