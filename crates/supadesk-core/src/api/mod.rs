//! HTTP clients for a Supabase project.
//!
//! - `SupabaseAuth` implements `AuthProvider` against Supabase Auth
//!   (password and refresh-token grants).
//! - `ReportClient` reads report rows through the REST API, authorizing each
//!   request with a token from the `SessionManager`.

pub mod client;
pub mod error;
pub mod supabase;

pub use client::{build_http_client, ReportClient, RetryPolicy, SupabaseEndpoint};
pub use error::ApiError;
pub use supabase::SupabaseAuth;
