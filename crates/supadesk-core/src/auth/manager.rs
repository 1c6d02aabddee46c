//! Session lifecycle: sign-in, sign-out, refresh, and token hand-out.
//!
//! `SessionManager` owns the single `Session` of a client instance. All
//! transitions go through it, and at most one sign-in or refresh is in flight
//! at any time. Callers that arrive while one is running join it and receive
//! the same outcome instead of issuing their own network call.
//!
//! Each sign-in, restore and sign-out starts a new generation. A flight that
//! resolves after its generation has been superseded leaves the session alone
//! and reports `NotAuthenticated` to its waiters.
//!
//! Flights run as spawned tasks, so they settle even when every caller
//! waiting on them has gone away.
//!
//! A refresh started because the token is inside the leeway window is
//! best effort: if it fails while the token is still valid, the session stays
//! `Authenticated` and the current token is returned.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::error::{AuthError, RefreshError, SessionError};
use super::provider::{AuthProvider, Renewal};
use super::session::{AccessToken, Credential, Session, SessionState, UserIdentity};

/// Refresh tokens this long before they expire.
const DEFAULT_REFRESH_LEEWAY_SECS: i64 = 30;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long before `expires_at` a token is treated as due for refresh.
    pub refresh_leeway: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_leeway: Duration::seconds(DEFAULT_REFRESH_LEEWAY_SECS),
        }
    }
}

/// Point-in-time view of the session for display and gating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub identity: Option<UserIdentity>,
    pub expires_at: Option<DateTime<Utc>>,
}

type Outcome = Result<AccessToken, SessionError>;
type Flight = Shared<BoxFuture<'static, Outcome>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightKind {
    SignIn,
    Refresh,
}

struct InFlight {
    kind: FlightKind,
    future: Flight,
}

struct Inner {
    session: Session,
    generation: u64,
    in_flight: Option<InFlight>,
}

struct Core {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionState>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, inner: &Inner) {
        let next = inner.session.state();
        self.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(old_state = %current, new_state = %next, "Session state transition");
            *current = next;
            true
        });
    }

    fn finish_sign_in(
        &self,
        generation: u64,
        result: Result<Credential, AuthError>,
        now: DateTime<Utc>,
    ) -> Outcome {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!("Discarding superseded sign-in result");
            return Err(SessionError::NotAuthenticated);
        }
        inner.in_flight = None;

        let result = result.and_then(|credential| {
            if credential.access_token.is_empty() {
                Err(AuthError::MalformedResponse("empty access token".to_string()))
            } else if credential.is_expired(now) {
                Err(AuthError::MalformedResponse(
                    "credential expired on arrival".to_string(),
                ))
            } else {
                Ok(credential)
            }
        });

        match result {
            Ok(credential) => {
                info!(
                    user_id = %credential.identity.id,
                    expires_at = %credential.expires_at,
                    "Signed in"
                );
                let token = credential.token();
                inner.session.authenticate(credential);
                self.publish(&inner);
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "Sign-in failed");
                inner.session.fail();
                self.publish(&inner);
                Err(e.into())
            }
        }
    }

    fn finish_refresh(
        &self,
        generation: u64,
        pending: Credential,
        early: bool,
        result: Result<Renewal, RefreshError>,
        now: DateTime<Utc>,
    ) -> Outcome {
        let mut inner = self.lock();
        if inner.generation != generation {
            debug!("Discarding superseded refresh result");
            return Err(SessionError::NotAuthenticated);
        }
        inner.in_flight = None;

        let result = result.and_then(|renewal| {
            if renewal.access_token.is_empty() {
                Err(RefreshError::MalformedResponse("empty access token".to_string()))
            } else if now >= renewal.expires_at {
                Err(RefreshError::MalformedResponse(
                    "renewed token expired on arrival".to_string(),
                ))
            } else {
                Ok(renewal)
            }
        });

        match result {
            Ok(renewal) => {
                let expires_at = renewal.expires_at;
                match inner.session.renew(renewal) {
                    Some(token) => {
                        info!(expires_at = %expires_at, "Session refreshed");
                        self.publish(&inner);
                        Ok(token)
                    }
                    None => {
                        inner.session.clear();
                        self.publish(&inner);
                        Err(SessionError::NotAuthenticated)
                    }
                }
            }
            Err(e) if early && !pending.is_expired(now) => {
                warn!(
                    error = %e,
                    expires_at = %pending.expires_at,
                    "Early refresh failed, keeping current token"
                );
                let mut kept = pending;
                if matches!(e, RefreshError::Revoked(_)) {
                    // Nothing left to renew with; the token is used until it expires
                    kept.refresh_token = None;
                }
                let token = kept.token();
                inner.session.authenticate(kept);
                self.publish(&inner);
                Ok(token)
            }
            Err(e) => {
                warn!(error = %e, "Session refresh failed, sign-in required");
                inner.session.expire();
                self.publish(&inner);
                Err(e.into())
            }
        }
    }
}

/// Handle to the client's session. Clone is cheap and every clone shares the
/// same session.
#[derive(Clone)]
pub struct SessionManager {
    core: Arc<Core>,
    provider: Arc<dyn AuthProvider>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        Self::with_config(provider, SessionConfig::default())
    }

    pub fn with_config(provider: Arc<dyn AuthProvider>, config: SessionConfig) -> Self {
        Self::with_clock(provider, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        provider: Arc<dyn AuthProvider>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Anonymous);
        let core = Core {
            inner: Mutex::new(Inner {
                session: Session::default(),
                generation: 0,
                in_flight: None,
            }),
            state_tx,
        };

        Self {
            core: Arc::new(core),
            provider,
            clock,
            config,
        }
    }

    pub fn state(&self) -> SessionState {
        self.core.lock().session.state()
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.core.lock();
        SessionStatus {
            state: inner.session.state(),
            identity: inner.session.identity().cloned(),
            expires_at: inner.session.expires_at(),
        }
    }

    pub fn identity(&self) -> Option<UserIdentity> {
        self.core.lock().session.identity().cloned()
    }

    /// Snapshot of the held credential, for persisting between runs.
    pub fn credential(&self) -> Option<Credential> {
        self.core.lock().session.credential().cloned()
    }

    /// Watch state transitions, e.g. to gate UI on `Authenticated`.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.core.state_tx.subscribe()
    }

    /// Sign in with an identifier and secret.
    ///
    /// Waits for any in-flight sign-in or refresh to settle first. On failure
    /// the session is left in `Failed` with no credential.
    pub async fn sign_in(&self, identifier: &str, secret: &str) -> Result<AccessToken, SessionError> {
        if identifier.trim().is_empty() || secret.is_empty() {
            return Err(AuthError::MissingCredentials.into());
        }

        let flight = loop {
            let pending = {
                let mut inner = self.core.lock();
                match inner.in_flight.as_ref().map(|f| f.future.clone()) {
                    Some(pending) => pending,
                    None => break self.start_sign_in(&mut inner, identifier, secret),
                }
            };
            let _ = pending.await;
        };

        flight.await
    }

    /// Discard the credential and return to `Anonymous`.
    ///
    /// Never blocks on the network. Any in-flight sign-in or refresh is
    /// abandoned and its waiters receive `NotAuthenticated`.
    pub fn sign_out(&self) {
        let mut inner = self.core.lock();
        inner.generation += 1;
        if let Some(flight) = inner.in_flight.take() {
            debug!(kind = ?flight.kind, "Abandoning in-flight operation");
        }
        let user_id = inner.session.identity().map(|i| i.id.clone());
        inner.session.clear();
        self.core.publish(&inner);
        info!(user_id = ?user_id, "Signed out");
    }

    /// Current access token, refreshing first if it has expired or is about to.
    pub async fn valid_token(&self) -> Result<AccessToken, SessionError> {
        let (kind, flight) = {
            let mut inner = self.core.lock();
            match inner.in_flight.as_ref().map(|f| (f.kind, f.future.clone())) {
                Some(joined) => joined,
                None => {
                    let now = self.clock.now();
                    let credential = match inner.session.credential() {
                        Some(c) if inner.session.state() == SessionState::Authenticated => {
                            if !c.needs_refresh(now, self.config.refresh_leeway) {
                                return Ok(c.token());
                            }
                            c.clone()
                        }
                        _ => return Err(SessionError::NotAuthenticated),
                    };

                    if credential.refresh_token.is_none() {
                        if !credential.is_expired(now) {
                            return Ok(credential.token());
                        }
                        debug!("Access token expired and cannot be renewed");
                        inner.session.expire();
                        self.core.publish(&inner);
                        return Err(SessionError::NotAuthenticated);
                    }

                    debug!(expires_at = %credential.expires_at, "Access token due for refresh");
                    (FlightKind::Refresh, self.start_refresh(&mut inner, credential, true))
                }
            }
        };

        joined_outcome(kind, flight.await)
    }

    /// Renew the current token now, regardless of its expiry. A failure ends
    /// the session even if the old token had time left.
    pub async fn refresh(&self) -> Result<AccessToken, SessionError> {
        let (kind, flight) = {
            let mut inner = self.core.lock();
            match inner.in_flight.as_ref().map(|f| (f.kind, f.future.clone())) {
                Some(joined) => joined,
                None => {
                    let credential = match inner.session.credential() {
                        Some(c) if inner.session.state() == SessionState::Authenticated => c.clone(),
                        _ => return Err(SessionError::NotAuthenticated),
                    };
                    (FlightKind::Refresh, self.start_refresh(&mut inner, credential, false))
                }
            }
        };

        joined_outcome(kind, flight.await)
    }

    /// Resume a previously persisted credential, replacing the current session.
    ///
    /// A credential that is still valid is adopted as-is. One that is due for
    /// refresh is renewed if it carries renewal material.
    pub async fn restore(&self, credential: Credential) -> Result<AccessToken, SessionError> {
        let flight = loop {
            let pending = {
                let mut inner = self.core.lock();
                match inner.in_flight.as_ref().map(|f| f.future.clone()) {
                    Some(pending) => pending,
                    None => {
                        inner.generation += 1;
                        let now = self.clock.now();
                        let renewable = credential.refresh_token.is_some();

                        if !credential.is_expired(now)
                            && !(renewable && credential.needs_refresh(now, self.config.refresh_leeway))
                        {
                            info!(user_id = %credential.identity.id, "Session restored");
                            let token = credential.token();
                            inner.session.authenticate(credential);
                            self.core.publish(&inner);
                            return Ok(token);
                        }

                        if !renewable {
                            debug!("Stored credential expired and cannot be renewed");
                            inner.session.clear();
                            self.core.publish(&inner);
                            return Err(SessionError::NotAuthenticated);
                        }

                        break self.start_refresh(&mut inner, credential, true);
                    }
                }
            };
            let _ = pending.await;
        };

        flight.await
    }

    fn start_sign_in(&self, inner: &mut Inner, identifier: &str, secret: &str) -> Flight {
        inner.generation += 1;
        let generation = inner.generation;
        inner.session.begin_authenticating();
        self.core.publish(inner);
        debug!(identifier = %identifier, "Signing in");

        let task = {
            let core = Arc::clone(&self.core);
            let provider = Arc::clone(&self.provider);
            let clock = Arc::clone(&self.clock);
            let identifier = identifier.to_string();
            let secret = secret.to_string();
            tokio::spawn(async move {
                let result = provider.authenticate(&identifier, &secret).await;
                core.finish_sign_in(generation, result, clock.now())
            })
        };

        let core = Arc::clone(&self.core);
        let clock = Arc::clone(&self.clock);
        let future = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let failure = AuthError::Service(format!("sign-in task failed: {e}"));
                    core.finish_sign_in(generation, Err(failure), clock.now())
                }
            }
        }
        .boxed()
        .shared();

        inner.in_flight = Some(InFlight {
            kind: FlightKind::SignIn,
            future: future.clone(),
        });
        future
    }

    /// `early` marks a refresh of a token that may still be valid; see the
    /// module docs.
    fn start_refresh(&self, inner: &mut Inner, credential: Credential, early: bool) -> Flight {
        let generation = inner.generation;
        let pending = inner.session.begin_refresh(credential);
        self.core.publish(inner);

        let task = {
            let core = Arc::clone(&self.core);
            let provider = Arc::clone(&self.provider);
            let clock = Arc::clone(&self.clock);
            let pending = pending.clone();
            tokio::spawn(async move {
                let result = provider.renew(&pending).await;
                core.finish_refresh(generation, pending, early, result, clock.now())
            })
        };

        let core = Arc::clone(&self.core);
        let clock = Arc::clone(&self.clock);
        let future = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let failure = RefreshError::Service(format!("refresh task failed: {e}"));
                    core.finish_refresh(generation, pending, early, Err(failure), clock.now())
                }
            }
        }
        .boxed()
        .shared();

        inner.in_flight = Some(InFlight {
            kind: FlightKind::Refresh,
            future: future.clone(),
        });
        future
    }
}

/// A caller that joined someone else's sign-in only learns whether it can
/// proceed; the credential error belongs to whoever signed in.
fn joined_outcome(kind: FlightKind, outcome: Outcome) -> Outcome {
    match (kind, outcome) {
        (FlightKind::SignIn, Err(SessionError::Auth(_))) => Err(SessionError::NotAuthenticated),
        (_, outcome) => outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::clock::ManualClock;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const PASSWORD: &str = "p";

    /// Auth service double with call counters and optional gates that hold
    /// sign-ins or renewals until the test releases them.
    struct ScriptedProvider {
        clock: Arc<ManualClock>,
        sign_ins: AtomicUsize,
        renewals: AtomicUsize,
        renewed_from: Mutex<Vec<String>>,
        renew_results: Mutex<VecDeque<Result<Renewal, RefreshError>>>,
        gate_sign_in: bool,
        gate_renew: bool,
        started: Notify,
        release: Notify,
    }

    impl ScriptedProvider {
        fn new(clock: Arc<ManualClock>) -> Self {
            Self {
                clock,
                sign_ins: AtomicUsize::new(0),
                renewals: AtomicUsize::new(0),
                renewed_from: Mutex::new(Vec::new()),
                renew_results: Mutex::new(VecDeque::new()),
                gate_sign_in: false,
                gate_renew: false,
                started: Notify::new(),
                release: Notify::new(),
            }
        }

        fn gated(mut self) -> Self {
            self.gate_renew = true;
            self
        }

        fn gated_sign_in(mut self) -> Self {
            self.gate_sign_in = true;
            self
        }

        async fn hold(&self) {
            self.started.notify_one();
            self.release.notified().await;
        }

        fn then_renew_with(&self, token: &str) {
            let renewal = Renewal {
                access_token: token.to_string(),
                refresh_token: Some(format!("refresh-{token}")),
                expires_at: self.clock.now() + Duration::seconds(7200),
            };
            self.renew_results.lock().unwrap().push_back(Ok(renewal));
        }

        fn then_fail_renew(&self, error: RefreshError) {
            self.renew_results.lock().unwrap().push_back(Err(error));
        }
    }

    impl AuthProvider for ScriptedProvider {
        fn authenticate<'a>(
            &'a self,
            identifier: &'a str,
            secret: &'a str,
        ) -> BoxFuture<'a, Result<Credential, AuthError>> {
            async move {
                self.sign_ins.fetch_add(1, Ordering::SeqCst);
                if self.gate_sign_in {
                    self.hold().await;
                }
                if secret != PASSWORD {
                    return Err(AuthError::InvalidCredentials(
                        "Invalid login credentials".to_string(),
                    ));
                }
                Ok(Credential {
                    access_token: "T1".to_string(),
                    refresh_token: Some("R1".to_string()),
                    expires_at: self.clock.now() + Duration::seconds(3600),
                    identity: UserIdentity {
                        id: format!("id-{identifier}"),
                        email: Some(format!("{identifier}@example.com")),
                    },
                })
            }
            .boxed()
        }

        fn renew<'a>(&'a self, current: &'a Credential) -> BoxFuture<'a, Result<Renewal, RefreshError>> {
            async move {
                self.renewals.fetch_add(1, Ordering::SeqCst);
                self.renewed_from
                    .lock()
                    .unwrap()
                    .push(current.access_token.clone());
                if self.gate_renew {
                    self.hold().await;
                }
                let next = self.renew_results.lock().unwrap().pop_front();
                next.unwrap_or_else(|| Err(RefreshError::Revoked("nothing scripted".to_string())))
            }
            .boxed()
        }
    }

    fn setup(provider: ScriptedProvider, clock: Arc<ManualClock>) -> (SessionManager, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let config = SessionConfig {
            refresh_leeway: Duration::seconds(30),
        };
        let manager = SessionManager::with_clock(provider.clone(), config, clock);
        (manager, provider)
    }

    fn fixture() -> (SessionManager, Arc<ScriptedProvider>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let (manager, provider) = setup(ScriptedProvider::new(clock.clone()), clock.clone());
        (manager, provider, clock)
    }

    fn gated_fixture() -> (SessionManager, Arc<ScriptedProvider>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let (manager, provider) = setup(ScriptedProvider::new(clock.clone()).gated(), clock.clone());
        (manager, provider, clock)
    }

    fn gated_sign_in_fixture() -> (SessionManager, Arc<ScriptedProvider>) {
        let clock = Arc::new(ManualClock::default());
        setup(ScriptedProvider::new(clock.clone()).gated_sign_in(), clock)
    }

    struct PanickingProvider;

    fn explode<T>() -> T {
        panic!("malformed grant")
    }

    impl AuthProvider for PanickingProvider {
        fn authenticate<'a>(
            &'a self,
            _identifier: &'a str,
            _secret: &'a str,
        ) -> BoxFuture<'a, Result<Credential, AuthError>> {
            async { explode() }.boxed()
        }

        fn renew<'a>(&'a self, _current: &'a Credential) -> BoxFuture<'a, Result<Renewal, RefreshError>> {
            async { explode() }.boxed()
        }
    }

    #[tokio::test]
    async fn test_starts_anonymous() {
        let (manager, provider, _) = fixture();
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert_eq!(manager.valid_token().await, Err(SessionError::NotAuthenticated));
        assert_eq!(manager.refresh().await, Err(SessionError::NotAuthenticated));
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sign_in_then_valid_token() {
        let (manager, provider, _) = fixture();

        let issued = manager.sign_in("u", PASSWORD).await.unwrap();
        assert_eq!(issued.as_str(), "T1");
        assert_eq!(manager.state(), SessionState::Authenticated);
        assert_eq!(manager.valid_token().await.unwrap(), issued);
        assert_eq!(manager.identity().unwrap().id, "id-u");
        assert_eq!(provider.sign_ins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_credentials_rejected_without_network() {
        let (manager, provider, _) = fixture();

        assert_eq!(
            manager.sign_in("", PASSWORD).await,
            Err(SessionError::Auth(AuthError::MissingCredentials))
        );
        assert_eq!(
            manager.sign_in("u", "").await,
            Err(SessionError::Auth(AuthError::MissingCredentials))
        );
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert_eq!(provider.sign_ins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_sign_in_never_leaves_stale_token() {
        let (manager, _, _) = fixture();
        manager.sign_in("u", PASSWORD).await.unwrap();

        let err = manager.sign_in("u", "wrong").await.unwrap_err();
        assert!(matches!(err, SessionError::Auth(AuthError::InvalidCredentials(_))));
        assert_eq!(manager.state(), SessionState::Failed);
        assert!(manager.credential().is_none());
        assert_eq!(manager.valid_token().await, Err(SessionError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_concurrent_valid_token_without_network() {
        let (manager, provider, _) = fixture();
        manager.sign_in("u", PASSWORD).await.unwrap();

        let results = futures::future::join_all((0..8).map(|_| manager.valid_token())).await;
        for result in results {
            assert_eq!(result.unwrap().as_str(), "T1");
        }
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 0);
        assert_eq!(provider.sign_ins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once_for_all_callers() {
        let (manager, provider, clock) = gated_fixture();
        manager.sign_in("u", "p").await.unwrap();
        provider.then_renew_with("T2");
        clock.advance(Duration::seconds(3601));

        let release = async {
            provider.started.notified().await;
            provider.release.notify_one();
        };
        let (a, b, c, ()) = tokio::join!(
            manager.valid_token(),
            manager.valid_token(),
            manager.valid_token(),
            release
        );

        assert_eq!(a.unwrap().as_str(), "T2");
        assert_eq!(b.unwrap().as_str(), "T2");
        assert_eq!(c.unwrap().as_str(), "T2");
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 1);
        assert_eq!(*provider.renewed_from.lock().unwrap(), vec!["T1".to_string()]);
        assert_eq!(manager.state(), SessionState::Authenticated);
        assert_eq!(manager.valid_token().await.unwrap().as_str(), "T2");
    }

    #[tokio::test]
    async fn test_failed_refresh_is_shared_and_expires_session() {
        let (manager, provider, clock) = gated_fixture();
        manager.sign_in("u", PASSWORD).await.unwrap();
        provider.then_fail_renew(RefreshError::Revoked("refresh token revoked".to_string()));
        clock.advance(Duration::hours(2));

        let release = async {
            provider.started.notified().await;
            provider.release.notify_one();
        };
        let (a, b, ()) = tokio::join!(manager.valid_token(), manager.valid_token(), release);

        let expected = Err(SessionError::Refresh(RefreshError::Revoked(
            "refresh token revoked".to_string(),
        )));
        assert_eq!(a, expected);
        assert_eq!(b, expected);
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state(), SessionState::Expired);
        assert!(manager.credential().is_none());
        assert_eq!(manager.valid_token().await, Err(SessionError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_sign_out_invalidates_in_flight_refresh() {
        let (manager, provider, clock) = gated_fixture();
        manager.sign_in("u", PASSWORD).await.unwrap();
        provider.then_renew_with("T2");
        clock.advance(Duration::hours(2));

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.valid_token().await })
        };
        provider.started.notified().await;
        assert_eq!(manager.state(), SessionState::Refreshing);

        manager.sign_out();
        provider.release.notify_one();

        assert_eq!(waiter.await.unwrap(), Err(SessionError::NotAuthenticated));
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert_eq!(manager.valid_token().await, Err(SessionError::NotAuthenticated));
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_explicit_refresh_rotates_token() {
        let (manager, provider, _) = fixture();
        manager.sign_in("u", PASSWORD).await.unwrap();
        provider.then_renew_with("T2");

        assert_eq!(manager.refresh().await.unwrap().as_str(), "T2");
        let credential = manager.credential().unwrap();
        assert_eq!(credential.refresh_token.as_deref(), Some("refresh-T2"));
        assert_eq!(credential.identity.id, "id-u");
    }

    #[tokio::test]
    async fn test_refresh_within_leeway() {
        let (manager, provider, clock) = fixture();
        manager.sign_in("u", PASSWORD).await.unwrap();
        provider.then_renew_with("T2");

        clock.advance(Duration::seconds(3600 - 10));
        assert_eq!(manager.valid_token().await.unwrap().as_str(), "T2");
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_renewal_expired_on_arrival_is_rejected() {
        let (manager, provider, clock) = fixture();
        manager.sign_in("u", PASSWORD).await.unwrap();
        provider.renew_results.lock().unwrap().push_back(Ok(Renewal {
            access_token: "T2".to_string(),
            refresh_token: None,
            expires_at: clock.now() - Duration::seconds(1),
        }));

        let err = manager.refresh().await.unwrap_err();
        assert!(matches!(err, SessionError::Refresh(RefreshError::MalformedResponse(_))));
        assert_eq!(manager.state(), SessionState::Expired);
    }

    #[tokio::test]
    async fn test_restore_valid_and_expired_credentials() {
        let (manager, provider, clock) = fixture();
        let credential = Credential {
            access_token: "stored".to_string(),
            refresh_token: Some("R0".to_string()),
            expires_at: clock.now() + Duration::hours(1),
            identity: UserIdentity {
                id: "id-u".to_string(),
                email: None,
            },
        };

        assert_eq!(manager.restore(credential.clone()).await.unwrap().as_str(), "stored");
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 0);

        provider.then_renew_with("T2");
        let expired = Credential {
            expires_at: clock.now() - Duration::minutes(5),
            ..credential.clone()
        };
        assert_eq!(manager.restore(expired.clone()).await.unwrap().as_str(), "T2");
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 1);

        let unrenewable = Credential {
            refresh_token: None,
            ..expired
        };
        assert_eq!(
            manager.restore(unrenewable).await,
            Err(SessionError::NotAuthenticated)
        );
        assert_eq!(manager.state(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_subscribers_observe_transitions() {
        let (manager, _, _) = fixture();
        let mut rx = manager.subscribe();
        assert_eq!(*rx.borrow(), SessionState::Anonymous);

        manager.sign_in("u", PASSWORD).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), SessionState::Authenticated);

        manager.sign_out();
        assert_eq!(*rx.borrow_and_update(), SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (manager, _, clock) = fixture();
        manager.sign_in("u", PASSWORD).await.unwrap();

        let status = manager.status();
        assert_eq!(status.state, SessionState::Authenticated);
        assert_eq!(status.identity.unwrap().email.as_deref(), Some("u@example.com"));
        assert_eq!(status.expires_at, Some(clock.now() + Duration::seconds(3600)));
    }

    #[tokio::test]
    async fn test_callers_join_in_flight_sign_in() {
        let (manager, provider) = gated_sign_in_fixture();

        let release = async {
            provider.started.notified().await;
            assert_eq!(manager.state(), SessionState::Authenticating);
            assert!(manager.credential().is_none());
            provider.release.notify_one();
        };
        let (signed_in, joined, refreshed, ()) = tokio::join!(
            manager.sign_in("u", PASSWORD),
            manager.valid_token(),
            manager.refresh(),
            release
        );

        assert_eq!(signed_in.unwrap().as_str(), "T1");
        assert_eq!(joined.unwrap().as_str(), "T1");
        assert_eq!(refreshed.unwrap().as_str(), "T1");
        assert_eq!(provider.sign_ins.load(Ordering::SeqCst), 1);
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_joiners_of_failed_sign_in_are_not_authenticated() {
        let (manager, provider) = gated_sign_in_fixture();

        let release = async {
            provider.started.notified().await;
            provider.release.notify_one();
        };
        let (signed_in, joined, refreshed, ()) = tokio::join!(
            manager.sign_in("u", "wrong"),
            manager.valid_token(),
            manager.refresh(),
            release
        );

        assert!(matches!(
            signed_in,
            Err(SessionError::Auth(AuthError::InvalidCredentials(_)))
        ));
        assert_eq!(joined, Err(SessionError::NotAuthenticated));
        assert_eq!(refreshed, Err(SessionError::NotAuthenticated));
        assert_eq!(manager.state(), SessionState::Failed);
        assert_eq!(provider.sign_ins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sign_out_discards_in_flight_sign_in() {
        let (manager, provider) = gated_sign_in_fixture();

        let sign_out = async {
            provider.started.notified().await;
            manager.sign_out();
            provider.release.notify_one();
        };
        let (signed_in, ()) = tokio::join!(manager.sign_in("u", PASSWORD), sign_out);

        assert_eq!(signed_in, Err(SessionError::NotAuthenticated));
        assert_eq!(manager.state(), SessionState::Anonymous);
        assert!(manager.credential().is_none());
        assert_eq!(manager.valid_token().await, Err(SessionError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_sign_in_waits_for_in_flight_refresh() {
        let (manager, provider, clock) = gated_fixture();
        manager.sign_in("u", PASSWORD).await.unwrap();
        provider.then_renew_with("T2");
        clock.advance(Duration::hours(2));

        let release = async {
            provider.started.notified().await;
            assert_eq!(manager.state(), SessionState::Refreshing);
            assert_eq!(provider.sign_ins.load(Ordering::SeqCst), 1);
            provider.release.notify_one();
        };
        let (refreshed, signed_in, ()) =
            tokio::join!(manager.valid_token(), manager.sign_in("v", PASSWORD), release);

        assert_eq!(refreshed.unwrap().as_str(), "T2");
        assert_eq!(signed_in.unwrap().as_str(), "T1");
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 1);
        assert_eq!(provider.sign_ins.load(Ordering::SeqCst), 2);
        assert_eq!(manager.identity().unwrap().id, "id-v");
    }

    #[tokio::test]
    async fn test_abandoned_sign_in_still_completes() {
        let (manager, provider) = gated_sign_in_fixture();
        let mut rx = manager.subscribe();

        let attempt = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            manager.sign_in("u", PASSWORD),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(manager.state(), SessionState::Authenticating);

        provider.release.notify_one();
        rx.wait_for(|state| *state == SessionState::Authenticated)
            .await
            .unwrap();
        assert_eq!(manager.valid_token().await.unwrap().as_str(), "T1");
        assert_eq!(provider.sign_ins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_early_refresh_keeps_unexpired_token() {
        let (manager, provider, clock) = fixture();
        manager.sign_in("u", PASSWORD).await.unwrap();
        provider.then_fail_renew(RefreshError::Network("offline".to_string()));
        clock.advance(Duration::seconds(3590));

        assert_eq!(manager.valid_token().await.unwrap().as_str(), "T1");
        assert_eq!(manager.state(), SessionState::Authenticated);
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 1);

        // Tried again on the next call
        provider.then_renew_with("T2");
        assert_eq!(manager.valid_token().await.unwrap().as_str(), "T2");
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_revoked_early_refresh_uses_token_until_expiry() {
        let (manager, provider, clock) = fixture();
        manager.sign_in("u", PASSWORD).await.unwrap();
        provider.then_fail_renew(RefreshError::Revoked("refresh token revoked".to_string()));
        clock.advance(Duration::seconds(3590));

        assert_eq!(manager.valid_token().await.unwrap().as_str(), "T1");
        assert!(manager.credential().unwrap().refresh_token.is_none());
        assert_eq!(manager.valid_token().await.unwrap().as_str(), "T1");
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 1);

        clock.advance(Duration::seconds(20));
        assert_eq!(manager.valid_token().await, Err(SessionError::NotAuthenticated));
        assert_eq!(manager.state(), SessionState::Expired);
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_explicit_refresh_failure_ends_session() {
        let (manager, provider, _) = fixture();
        manager.sign_in("u", PASSWORD).await.unwrap();
        provider.then_fail_renew(RefreshError::Network("offline".to_string()));

        assert_eq!(
            manager.refresh().await,
            Err(SessionError::Refresh(RefreshError::Network("offline".to_string())))
        );
        assert_eq!(manager.state(), SessionState::Expired);
    }

    #[tokio::test]
    async fn test_restored_credential_without_refresh_token() {
        let (manager, provider, clock) = fixture();
        let credential = Credential {
            access_token: "stored".to_string(),
            refresh_token: None,
            expires_at: clock.now() + Duration::seconds(10),
            identity: UserIdentity {
                id: "id-u".to_string(),
                email: None,
            },
        };

        assert_eq!(manager.restore(credential).await.unwrap().as_str(), "stored");
        assert_eq!(manager.valid_token().await.unwrap().as_str(), "stored");
        assert_eq!(manager.state(), SessionState::Authenticated);

        clock.advance(Duration::seconds(11));
        assert_eq!(manager.valid_token().await, Err(SessionError::NotAuthenticated));
        assert_eq!(manager.state(), SessionState::Expired);
        assert_eq!(provider.renewals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_provider_fails_instead_of_poisoning() {
        let manager = SessionManager::new(Arc::new(PanickingProvider));

        for _ in 0..2 {
            let err = manager.sign_in("u", PASSWORD).await.unwrap_err();
            assert!(matches!(err, SessionError::Auth(AuthError::Service(_))));
            assert_eq!(manager.state(), SessionState::Failed);
        }
    }
}
