//! Authentication module for the client's session.
//!
//! This module provides:
//! - `SessionManager`: owns the single session, serializes sign-in, refresh
//!   and sign-out, and hands out valid access tokens
//! - `AuthProvider`: the seam to the external authentication service
//! - `SessionStore`: on-disk persistence of the credential between runs
//! - `CredentialStore`: secure OS-level password storage via keyring

pub mod clock;
pub mod credentials;
pub mod error;
pub mod manager;
pub mod provider;
pub mod session;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credentials::CredentialStore;
pub use error::{AuthError, RefreshError, SessionError};
pub use manager::{SessionConfig, SessionManager, SessionStatus};
pub use provider::{AuthProvider, Renewal};
pub use session::{AccessToken, Credential, Session, SessionState, UserIdentity};
pub use store::SessionStore;
