//! Core library for supadesk.
//!
//! A client for a Supabase project that keeps one authenticated session per
//! instance and reads report data with it. The `auth` module owns the session
//! lifecycle; `api` talks HTTP to Supabase Auth and the REST API; `cache`
//! keeps reports for offline viewing.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;
pub mod utils;

pub use api::{ApiError, ReportClient, SupabaseAuth, SupabaseEndpoint};
pub use auth::{
    AccessToken, AuthError, AuthProvider, Credential, RefreshError, SessionError, SessionManager,
    SessionState,
};
pub use config::Config;
pub use models::{Report, ReportQuery};
