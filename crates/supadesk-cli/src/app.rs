//! Application wiring for the command line front end.
//!
//! `App` builds the session, HTTP clients, session store and report cache from
//! the configuration, restores any stored session on start, and persists the
//! session after every command that may have changed it.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use supadesk_core::api::{build_http_client, ApiError, ReportClient, SupabaseAuth};
use supadesk_core::auth::{
    AccessToken, AuthError, CredentialStore, SessionError, SessionManager, SessionStatus,
    SessionStore,
};
use supadesk_core::cache::ReportCache;
use supadesk_core::config::Config;
use supadesk_core::models::{Report, ReportQuery};

/// Password from the environment, for scripted use.
const ENV_PASSWORD: &str = "SUPADESK_PASSWORD";

/// Where a displayed report came from.
pub enum ReportSource {
    Live,
    Cached { age: String },
}

pub struct App {
    pub config: Config,
    pub session: SessionManager,
    auth: SupabaseAuth,
    reports: ReportClient,
    store: SessionStore,
    cache: ReportCache,
}

impl App {
    pub async fn new(config: Config) -> Result<Self> {
        let endpoint = config.endpoint()?;
        let cache_dir = config.cache_dir().unwrap_or_else(|_| PathBuf::from("./cache"));
        debug!(?cache_dir, "Cache directory configured");

        // Both clients share one connection pool
        let http = build_http_client().context("Failed to build HTTP client")?;
        let auth = SupabaseAuth::with_client(http.clone(), endpoint.clone());
        let session = SessionManager::with_config(Arc::new(auth.clone()), config.session_config());
        let reports = ReportClient::with_client(http, endpoint, session.clone());

        let app = Self {
            store: SessionStore::new(cache_dir.clone()),
            cache: ReportCache::new(cache_dir)?,
            config,
            session,
            auth,
            reports,
        };
        app.restore_session().await;
        Ok(app)
    }

    async fn restore_session(&self) {
        match self.store.load() {
            Ok(Some(credential)) => {
                match self.session.restore(credential).await {
                    Ok(_) => debug!("Stored session restored"),
                    Err(e) => info!(error = %e, "Stored session is no longer usable"),
                }
                // A refresh during restore rotates the refresh token
                self.persist_session();
            }
            Ok(None) => debug!("No stored session"),
            Err(e) => warn!(error = %e, "Failed to load stored session"),
        }
    }

    /// Write whatever the session holds now; clears the file when signed out.
    fn persist_session(&self) {
        let result = match self.session.credential() {
            Some(credential) => self.store.save(&credential),
            None => self.store.clear(),
        };
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist session");
        }
    }

    pub async fn login(&mut self, email: Option<String>, remember: bool) -> Result<()> {
        let email = match email {
            Some(email) => email,
            None => prompt_email(self.config.last_email.as_deref())?,
        };

        let (password, from_keychain) = match std::env::var(ENV_PASSWORD) {
            Ok(password) if !password.is_empty() => (password, false),
            _ => match CredentialStore::get_password(&email) {
                Ok(Some(password)) => (password, true),
                Ok(None) => (prompt_password()?, false),
                Err(e) => {
                    warn!(error = %e, "Keychain unavailable");
                    (prompt_password()?, false)
                }
            },
        };

        match self.session.sign_in(&email, &password).await {
            Ok(_) => {
                if remember {
                    if let Err(e) = CredentialStore::store(&email, &password) {
                        warn!(error = %e, "Failed to store credentials");
                    }
                }

                self.config.last_email = Some(email);
                if let Err(e) = self.config.save() {
                    warn!(error = %e, "Failed to save config");
                }
                self.persist_session();
                Ok(())
            }
            Err(e) => {
                self.persist_session();
                if from_keychain && matches!(e, SessionError::Auth(AuthError::InvalidCredentials(_))) {
                    info!("Stored password rejected, removing it from the keychain");
                    if let Err(e) = CredentialStore::delete(&email) {
                        warn!(error = %e, "Failed to delete stored password");
                    }
                }
                Err(anyhow::anyhow!(login_error_message(&e)))
            }
        }
    }

    pub async fn logout(&self, forget: bool) -> Result<()> {
        // Server-side revocation is best effort; local sign-out always happens
        if let Some(credential) = self.session.credential() {
            if let Err(e) = self.auth.logout(&credential.token()).await {
                warn!(error = %e, "Failed to revoke session server-side");
            }
        }

        self.session.sign_out();
        self.persist_session();

        match self.cache.clear() {
            Ok(removed) => debug!(removed, "Cleared cached reports"),
            Err(e) => warn!(error = %e, "Failed to clear report cache"),
        }

        if forget {
            if let Some(ref email) = self.config.last_email {
                CredentialStore::delete(email)?;
            }
        }
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub async fn token(&self) -> Result<AccessToken> {
        let result = self.session.valid_token().await;
        self.persist_session();
        result.map_err(|e| anyhow::anyhow!(session_error_message(&e)))
    }

    /// Fetch a report, falling back to the cached copy when the service cannot
    /// be reached. `offline` skips the network entirely.
    pub async fn report(&self, query: &ReportQuery, offline: bool) -> Result<(Report, ReportSource)> {
        if offline {
            return self
                .cached_report(query)?
                .ok_or_else(|| anyhow::anyhow!("No cached copy of {}", query));
        }

        let result = self.reports.fetch(query).await;
        self.persist_session();

        match result {
            Ok(report) => {
                if let Err(e) = self.cache.save_report(query, &report) {
                    warn!(error = %e, "Failed to cache report");
                }
                Ok((report, ReportSource::Live))
            }
            Err(ApiError::NetworkError(e)) => {
                warn!(error = %e, "Report fetch failed, trying cache");
                self.cached_report(query)?
                    .ok_or_else(|| anyhow::anyhow!("Network error: {}", e))
            }
            Err(ApiError::Session(e)) => Err(anyhow::anyhow!(session_error_message(&e))),
            Err(e) if e.requires_sign_in() => {
                Err(anyhow::anyhow!("{} - run `supadesk login`", e))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn cached_report(&self, query: &ReportQuery) -> Result<Option<(Report, ReportSource)>> {
        let cached = self.cache.load_report(query)?;
        Ok(cached.map(|cached| {
            if cached.is_stale(self.config.report_stale_minutes) {
                warn!(age = %cached.age_display(), "Cached report is stale");
            }
            let age = cached.age_display();
            (cached.data, ReportSource::Cached { age })
        }))
    }
}

/// Map sign-in failures to messages a person can act on.
fn login_error_message(error: &SessionError) -> String {
    match error {
        SessionError::Auth(AuthError::InvalidCredentials(_)) => "Invalid email or password".to_string(),
        SessionError::Auth(AuthError::MissingCredentials) => "Email and password required".to_string(),
        SessionError::Auth(AuthError::Network(_)) => {
            "Unable to connect to Supabase. Check your internet connection.".to_string()
        }
        SessionError::Auth(AuthError::Timeout) => "Connection timed out. Please try again.".to_string(),
        other => format!("Login failed: {}", other),
    }
}

fn session_error_message(error: &SessionError) -> String {
    if error.requires_sign_in() {
        format!("{} - run `supadesk login`", error)
    } else {
        error.to_string()
    }
}

fn prompt_email(last_email: Option<&str>) -> Result<String> {
    match last_email {
        Some(last) => print!("Email [{}]: ", last),
        None => print!("Email: "),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    match (input.is_empty(), last_email) {
        (true, Some(last)) => Ok(last.to_string()),
        _ => Ok(input.to_string()),
    }
}

fn prompt_password() -> Result<String> {
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}
