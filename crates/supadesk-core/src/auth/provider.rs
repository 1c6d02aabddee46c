use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use super::error::{AuthError, RefreshError};
use super::session::Credential;

/// Result of renewing a credential.
#[derive(Debug, Clone)]
pub struct Renewal {
    pub access_token: String,
    /// Replacement renewal material, if the service rotated it.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// The external authentication service the session depends on.
///
/// Timeouts are the implementation's concern and are reported as the
/// `Timeout` variant of the respective error.
pub trait AuthProvider: Send + Sync {
    /// Exchange an identifier and secret for a credential.
    fn authenticate<'a>(
        &'a self,
        identifier: &'a str,
        secret: &'a str,
    ) -> BoxFuture<'a, Result<Credential, AuthError>>;

    /// Exchange the current credential for a fresh token.
    fn renew<'a>(&'a self, current: &'a Credential) -> BoxFuture<'a, Result<Renewal, RefreshError>>;
}
