use thiserror::Error;

/// Failure while exchanging an identifier and secret for a credential.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Identifier and secret are required")]
    MissingCredentials,

    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication request timed out")]
    Timeout,

    #[error("Service error: {0}")]
    Service(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

/// Failure while renewing an existing credential.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("Token expired or revoked: {0}")]
    Revoked(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Refresh request timed out")]
    Timeout,

    #[error("Service error: {0}")]
    Service(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

/// Error surfaced by `SessionManager` operations.
///
/// Every variant is recoverable by signing in again. `Clone` so the outcome of
/// one shared sign-in or refresh can be handed to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error("Not authenticated - sign in required")]
    NotAuthenticated,
}

impl SessionError {
    /// True when the caller should prompt for credentials rather than retry.
    pub fn requires_sign_in(&self) -> bool {
        match self {
            SessionError::NotAuthenticated => true,
            SessionError::Refresh(_) => true,
            SessionError::Auth(AuthError::InvalidCredentials(_))
            | SessionError::Auth(AuthError::MissingCredentials) => true,
            SessionError::Auth(_) => false,
        }
    }
}
