use thiserror::Error;

use crate::api::ApiError;

/// Every failure that crosses the `SessionManager` boundary is one of these.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Not logged in")]
    Unauthenticated,

    #[error("Session expired - please log in again")]
    SessionExpired,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Session storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl SessionError {
    /// Wrap a storage backend failure, keeping its context chain in the message.
    pub(crate) fn storage(err: anyhow::Error) -> Self {
        SessionError::Storage(format!("{:#}", err))
    }

    /// True for the terminal conditions that should route the user to a login prompt.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            SessionError::Unauthenticated | SessionError::SessionExpired
        )
    }
}
