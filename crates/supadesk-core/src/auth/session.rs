use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::provider::Renewal;

/// Authentication state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Anonymous,
    Authenticating,
    Authenticated,
    Refreshing,
    Expired,
    Failed,
}

impl SessionState {
    /// States in which a credential is held.
    pub fn holds_credential(self) -> bool {
        matches!(self, SessionState::Authenticated | SessionState::Refreshing)
    }

    pub fn label(self) -> &'static str {
        match self {
            SessionState::Anonymous => "anonymous",
            SessionState::Authenticating => "authenticating",
            SessionState::Authenticated => "authenticated",
            SessionState::Refreshing => "refreshing",
            SessionState::Expired => "expired",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Who the credential was issued to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl UserIdentity {
    pub fn display_name(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.id)
    }
}

/// Opaque bearer token. Clone is cheap.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(Arc<str>);

impl AccessToken {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// Credential issued by the auth service.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    /// Renewal material, when the service hands one out.
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub identity: UserIdentity,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Check if the credential will expire within `leeway` and should be refreshed
    pub fn needs_refresh(&self, now: DateTime<Utc>, leeway: Duration) -> bool {
        now + leeway >= self.expires_at
    }

    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    pub fn token(&self) -> AccessToken {
        AccessToken::new(self.access_token.as_str())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .field("identity", &self.identity)
            .finish()
    }
}

/// The client's single authentication context.
///
/// Only `SessionManager` mutates a session; everything else reads snapshots.
#[derive(Debug, Clone)]
pub struct Session {
    state: SessionState,
    credential: Option<Credential>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            state: SessionState::Anonymous,
            credential: None,
        }
    }
}

impl Session {
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The bearer token, only while a credential is held.
    pub fn access_token(&self) -> Option<AccessToken> {
        if !self.state.holds_credential() {
            return None;
        }
        self.credential.as_ref().map(Credential::token)
    }

    pub fn credential(&self) -> Option<&Credential> {
        if self.state.holds_credential() {
            self.credential.as_ref()
        } else {
            None
        }
    }

    pub fn identity(&self) -> Option<&UserIdentity> {
        self.credential().map(|c| &c.identity)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.credential().map(|c| c.expires_at)
    }

    pub(crate) fn begin_authenticating(&mut self) {
        self.state = SessionState::Authenticating;
        self.credential = None;
    }

    pub(crate) fn authenticate(&mut self, credential: Credential) {
        self.state = SessionState::Authenticated;
        self.credential = Some(credential);
    }

    pub(crate) fn fail(&mut self) {
        self.state = SessionState::Failed;
        self.credential = None;
    }

    /// Move to `Refreshing`, returning the credential to renew.
    pub(crate) fn begin_refresh(&mut self, credential: Credential) -> Credential {
        self.state = SessionState::Refreshing;
        self.credential = Some(credential.clone());
        credential
    }

    /// Apply a renewal. The identity is carried over unchanged.
    pub(crate) fn renew(&mut self, renewal: Renewal) -> Option<AccessToken> {
        let credential = self.credential.as_mut()?;
        credential.access_token = renewal.access_token;
        if renewal.refresh_token.is_some() {
            credential.refresh_token = renewal.refresh_token;
        }
        credential.expires_at = renewal.expires_at;
        self.state = SessionState::Authenticated;
        Some(credential.token())
    }

    pub(crate) fn expire(&mut self) {
        self.state = SessionState::Expired;
        self.credential = None;
    }

    pub(crate) fn clear(&mut self) {
        self.state = SessionState::Anonymous;
        self.credential = None;
    }
}
