//! The session lifecycle controller.
//!
//! One `SessionController` per portal owns the in-memory session, the
//! persisted copy, the remember-me vault, and the two background tasks that
//! run while someone is signed in:
//! - a periodic check that expires, refreshes, or re-syncs the session with
//!   what other windows wrote to shared storage
//! - a debounced activity listener that slides the expiry forward
//!
//! All state lives behind one `std::sync::Mutex` that is never held across
//! an await. Network calls snapshot what they need, release the lock, and
//! re-validate against the session epoch when they come back: any sign-in
//! or sign-out bumps the epoch, so a response that belongs to a session
//! that no longer exists is dropped instead of resurrecting it.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{ApiError, AuthApi, Registration};
use crate::auth::{CredentialVault, RememberedLogin, Session, SessionStore};
use crate::clock::Clock;
use crate::config::PortalProfile;
use crate::models::{Permissions, ProfileUpdate, Role, UserRecord};
use crate::storage::KeyValueStore;

use super::activity::{ActivityHandle, ActivityMonitor, ActivitySignal};
use super::state::{AuthError, AuthSnapshot, AuthState, LoginRequest, Notice, SessionEvent};

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 64;

/// Why a profile re-fetch is running. Only changes how failures are logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshOrigin {
    Startup,
    Periodic,
    Manual,
}

/// Background work attached while a session is held.
struct LifecycleHandle {
    checker: JoinHandle<()>,
    activity: ActivityHandle,
}

impl LifecycleHandle {
    fn stop(mut self) {
        self.checker.abort();
        self.activity.stop();
    }
}

struct Inner {
    state: AuthState,
    session: Option<Session>,
    /// Bumped on every sign-in and sign-out.
    epoch: u64,
    /// Profile fetches in flight for the current epoch.
    refreshing: u32,
    lifecycle: Option<LifecycleHandle>,
}

struct Shared {
    profile: PortalProfile,
    api: Arc<dyn AuthApi>,
    sessions: SessionStore,
    vault: Option<CredentialVault>,
    events: broadcast::Sender<SessionEvent>,
    inner: Mutex<Inner>,
}

/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(
        profile: PortalProfile,
        api: Arc<dyn AuthApi>,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let sessions = SessionStore::new(store.clone(), clock.clone(), profile.keys, profile.policy);
        let vault = profile.keys.remember_me.map(|key| {
            CredentialVault::new(store, clock, key, profile.policy.max_remember_age)
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                profile,
                api,
                sessions,
                vault,
                events,
                inner: Mutex::new(Inner {
                    state: AuthState::Unauthenticated,
                    session: None,
                    epoch: 0,
                    refreshing: 0,
                    lifecycle: None,
                }),
            }),
        }
    }

    pub fn profile(&self) -> &PortalProfile {
        &self.shared.profile
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> AuthState {
        self.lock().state
    }

    /// Current session, if one is held.
    pub fn session(&self) -> Option<Session> {
        self.lock().session.clone()
    }

    pub fn current_user(&self) -> Option<UserRecord> {
        self.lock().session.as_ref().map(|s| s.identity().clone())
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        let inner = self.lock();
        let user = inner.session.as_ref().map(|s| s.identity().clone());
        let permissions = user
            .as_ref()
            .map(|u| *u.permissions())
            .unwrap_or(Permissions::NONE);
        AuthSnapshot {
            state: inner.state,
            user,
            permissions,
        }
    }

    /// The role's permission table, or `NONE` when signed out.
    pub fn permissions(&self) -> &'static Permissions {
        match self.lock().session.as_ref() {
            Some(session) => session.identity().role.permissions(),
            None => Role::Unknown.permissions(),
        }
    }

    /// Startup: adopt whatever session storage holds, then confirm it with
    /// one profile fetch.
    ///
    /// A stored, unexpired session is trusted immediately so a page reload
    /// never flashes a sign-in screen. Only a 401 from the confirmation
    /// fetch signs the user out; any other failure keeps the cached identity.
    pub async fn restore(&self) {
        {
            let mut inner = self.lock();
            if inner.state.is_signed_in() {
                debug!("Restore skipped, session already held");
                return;
            }
            self.set_state(&mut inner, AuthState::Restoring);

            match self.shared.sessions.load() {
                None => {
                    debug!("No stored session");
                    self.set_state(&mut inner, AuthState::Unauthenticated);
                    return;
                }
                Some(session) if !self.shared.sessions.is_valid(&session) => {
                    info!(expired_at = %session.expires_at(), "Stored session has expired");
                    self.sign_out(&mut inner, Some(Notice::SessionExpired));
                    return;
                }
                Some(session) => {
                    let role = session.identity().role;
                    if !self.shared.profile.allows(role) {
                        self.deny(&mut inner, role);
                        return;
                    }
                    info!(user_id = session.identity().id, "Restored stored session");
                    self.sign_in(&mut inner, session);
                }
            }
        }

        self.refresh_identity(RefreshOrigin::Startup).await;
    }

    pub async fn login(&self, request: LoginRequest) -> Result<UserRecord, AuthError> {
        if request.login.trim().is_empty() || request.password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let payload = match self
            .shared
            .api
            .login(request.login.trim(), &request.password)
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Login failed");
                return Err(AuthError::from_api(e));
            }
        };

        let user = payload.user;
        let mut inner = self.lock();
        if !self.shared.profile.allows(user.role) {
            self.deny(&mut inner, user.role);
            return Err(self.access_denied(user.role));
        }

        let session = self.shared.sessions.save(&payload.token, user.clone());
        if let Some(vault) = &self.shared.vault {
            if request.remember_me {
                vault.save(request.login.trim(), &request.password);
            } else {
                vault.clear();
            }
        }
        info!(user_id = user.id, role = %user.role, "Signed in");
        self.sign_in(&mut inner, session);
        Ok(user)
    }

    /// Create an account and sign straight into it.
    pub async fn register(&self, registration: Registration) -> Result<UserRecord, AuthError> {
        if registration.email.trim().is_empty() || registration.password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let payload = match self.shared.api.register(&registration).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Registration failed");
                return Err(AuthError::from_api(e));
            }
        };

        let user = payload.user;
        let mut inner = self.lock();
        if !self.shared.profile.allows(user.role) {
            self.deny(&mut inner, user.role);
            return Err(self.access_denied(user.role));
        }
        let session = self.shared.sessions.save(&payload.token, user.clone());
        info!(user_id = user.id, "Registered and signed in");
        self.sign_in(&mut inner, session);
        Ok(user)
    }

    /// Sign out. Always succeeds locally; the backend is told on a
    /// best-effort basis. The remember-me record is left alone.
    pub async fn logout(&self) {
        let token = {
            let mut inner = self.lock();
            let token = inner.session.as_ref().map(|s| s.token().to_string());
            self.sign_out(&mut inner, None);
            token
        };

        if let Some(token) = token {
            if let Err(e) = self.shared.api.logout(&token).await {
                debug!(error = %e, "Remote logout failed, ignoring");
            }
            info!("Signed out");
        }
    }

    /// Re-fetch the identity for the current token.
    pub async fn refresh(&self) {
        self.refresh_identity(RefreshOrigin::Manual).await;
    }

    async fn refresh_identity(&self, origin: RefreshOrigin) {
        let (token, epoch) = {
            let mut inner = self.lock();
            if !inner.state.is_signed_in() {
                return;
            }
            let Some(token) = inner.session.as_ref().map(|s| s.token().to_string()) else {
                return;
            };
            inner.refreshing += 1;
            self.set_state(&mut inner, AuthState::Refreshing);
            (token, inner.epoch)
        };

        let result = self.shared.api.fetch_profile(&token).await;

        let mut inner = self.lock();
        if !Self::is_current(&inner, epoch, &token) {
            debug!(?origin, "Discarding stale profile response");
            return;
        }
        inner.refreshing = inner.refreshing.saturating_sub(1);

        match result {
            Ok(user) => {
                if !self.shared.profile.allows(user.role) {
                    self.deny(&mut inner, user.role);
                    return;
                }
                let session = self.shared.sessions.save(&token, user.clone());
                let changed = inner
                    .session
                    .as_ref()
                    .is_some_and(|s| s.identity() != &user);
                inner.session = Some(session);
                self.settle(&mut inner);
                if changed {
                    self.emit(SessionEvent::IdentityChanged(user));
                }
                debug!(?origin, "Session refreshed");
            }
            Err(e) if e.is_unauthorized() => {
                info!(?origin, "Token rejected by the server");
                self.sign_out(&mut inner, Some(Notice::SessionRevoked));
            }
            Err(e) => {
                match origin {
                    RefreshOrigin::Startup => {
                        warn!(error = %e, "Could not confirm stored session, keeping it")
                    }
                    RefreshOrigin::Periodic | RefreshOrigin::Manual => {
                        debug!(error = %e, "Session refresh failed, keeping session")
                    }
                }
                self.settle(&mut inner);
            }
        }
    }

    /// Back to `Authenticated` once the last in-flight refresh has landed.
    fn settle(&self, inner: &mut Inner) {
        if inner.refreshing == 0 {
            self.set_state(inner, AuthState::Authenticated);
        }
    }

    /// One pass of the background check: pick up changes other windows
    /// made to shared storage, then expire or refresh the session.
    pub async fn periodic_check(&self) {
        let needs_refresh = {
            let mut inner = self.lock();
            // A refresh in flight will settle the session itself.
            if inner.state != AuthState::Authenticated {
                return;
            }
            let Some(held) = inner.session.clone() else {
                return;
            };
            let Some(current) = self.reconcile(&mut inner, held) else {
                return;
            };

            let sessions = &self.shared.sessions;
            if !sessions.is_valid(&current) {
                info!(expired_at = %current.expires_at(), "Session expired");
                self.sign_out(&mut inner, Some(Notice::SessionExpired));
                return;
            }
            sessions.needs_refresh(&current)
        };

        if needs_refresh {
            self.refresh_identity(RefreshOrigin::Periodic).await;
        }
    }

    /// Merge the held session with what shared storage holds now, which
    /// another window may have replaced, extended, or removed. Returns the
    /// session to carry on with, or `None` if this window is now signed out.
    fn reconcile(&self, inner: &mut Inner, held: Session) -> Option<Session> {
        let sessions = &self.shared.sessions;
        let current = match sessions.load() {
            None if !sessions.is_valid(&held) => held,
            None if !sessions.in_sync() => {
                debug!("Session was never persisted, keeping the in-memory copy");
                held
            }
            None => {
                info!("Stored session disappeared, signing out");
                self.sign_out(inner, Some(Notice::SignedOutElsewhere));
                return None;
            }
            Some(stored) if stored.token() != held.token() => {
                let role = stored.identity().role;
                if !self.shared.profile.allows(role) {
                    self.deny(inner, role);
                    return None;
                }
                info!(user_id = stored.identity().id, "Adopting session from another window");
                // In-flight responses belong to the replaced token.
                inner.epoch += 1;
                inner.refreshing = 0;
                self.set_state(inner, AuthState::Authenticated);
                self.emit(SessionEvent::IdentityChanged(stored.identity().clone()));
                stored
            }
            Some(stored) if stored.expires_at() > held.expires_at() => {
                if stored.identity() != held.identity() {
                    let role = stored.identity().role;
                    if !self.shared.profile.allows(role) {
                        self.deny(inner, role);
                        return None;
                    }
                    debug!("Identity updated by another window");
                    self.emit(SessionEvent::IdentityChanged(stored.identity().clone()));
                }
                stored
            }
            Some(_) => held,
        };
        inner.session = Some(current.clone());
        Some(current)
    }

    /// Debounced activity tick: slide the expiry forward once less than
    /// half of the session duration remains. Storage is re-read first so an
    /// extension never overwrites another window's sign-out or sign-in.
    pub fn handle_activity(&self) {
        let mut inner = self.lock();
        if !inner.state.is_signed_in() {
            return;
        }
        let Some(held) = inner.session.clone() else {
            return;
        };
        let Some(session) = self.reconcile(&mut inner, held) else {
            return;
        };
        let sessions = &self.shared.sessions;

        if !sessions.is_valid(&session) {
            info!("Session expired before activity was seen");
            self.sign_out(&mut inner, Some(Notice::SessionExpired));
            return;
        }
        let half = sessions.policy().session_duration / 2;
        if sessions.remaining(&session) <= half {
            let extended = sessions.extend(&session);
            debug!(expires_at = %extended.expires_at(), "Session extended on activity");
            inner.session = Some(extended);
        }
    }

    /// Feed a raw interaction event. Ignored while signed out.
    pub fn record_activity(&self, signal: ActivitySignal) {
        if let Some(lifecycle) = &self.lock().lifecycle {
            lifecycle.activity.notify(signal);
        }
    }

    pub async fn update_profile(&self, update: ProfileUpdate) -> Result<UserRecord, AuthError> {
        let (token, epoch) = self.current_token()?;

        let result = self.shared.api.update_profile(&token, &update).await;

        let mut inner = self.lock();
        if !Self::is_current(&inner, epoch, &token) {
            return Err(AuthError::NotSignedIn);
        }
        let user = match result {
            Ok(user) => user,
            Err(e) if e.is_unauthorized() => {
                self.sign_out(&mut inner, Some(Notice::SessionRevoked));
                return Err(AuthError::SessionEnded);
            }
            Err(e) => return Err(AuthError::from_api(e)),
        };

        if !self.shared.profile.allows(user.role) {
            self.deny(&mut inner, user.role);
            return Err(self.access_denied(user.role));
        }
        let session = self.shared.sessions.save(&token, user.clone());
        inner.session = Some(session);
        self.emit(SessionEvent::IdentityChanged(user.clone()));
        Ok(user)
    }

    /// Run an authenticated API call with the current token. A 401 from
    /// `call` signs the session out, as long as it is still the session the
    /// call was made with.
    pub async fn authorized<T, F, Fut>(&self, call: F) -> Result<T, AuthError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let (token, epoch) = self.current_token()?;

        match call(token.clone()).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_unauthorized() => {
                let mut inner = self.lock();
                if Self::is_current(&inner, epoch, &token) {
                    self.sign_out(&mut inner, Some(Notice::SessionRevoked));
                }
                Err(AuthError::SessionEnded)
            }
            Err(e) => Err(AuthError::from_api(e)),
        }
    }

    /// For hosts that make their own requests: a 401 was seen with the
    /// current token.
    pub fn report_unauthorized(&self) {
        let mut inner = self.lock();
        if inner.state.is_signed_in() {
            self.sign_out(&mut inner, Some(Notice::SessionRevoked));
        }
    }

    /// Remembered credentials for prefilling the sign-in form.
    pub fn remembered_login(&self) -> Option<RememberedLogin> {
        self.shared.vault.as_ref()?.load()
    }

    pub fn forget_login(&self) {
        if let Some(vault) = &self.shared.vault {
            vault.clear();
        }
    }

    /// Stop background work without touching the session. For process exit.
    pub fn shutdown(&self) {
        if let Some(lifecycle) = self.lock().lifecycle.take() {
            lifecycle.stop();
            debug!("Lifecycle tasks stopped");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.shared.events.send(event);
    }

    fn set_state(&self, inner: &mut Inner, state: AuthState) {
        if inner.state != state {
            inner.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn is_current(inner: &Inner, epoch: u64, token: &str) -> bool {
        inner.epoch == epoch
            && inner.state.is_signed_in()
            && inner.session.as_ref().is_some_and(|s| s.token() == token)
    }

    /// Token and epoch of a live session. An expired session found here is
    /// signed out on the spot.
    fn current_token(&self) -> Result<(String, u64), AuthError> {
        let mut inner = self.lock();
        if !inner.state.is_signed_in() {
            return Err(AuthError::NotSignedIn);
        }
        let Some(session) = inner.session.clone() else {
            return Err(AuthError::NotSignedIn);
        };
        if !self.shared.sessions.is_valid(&session) {
            self.sign_out(&mut inner, Some(Notice::SessionExpired));
            return Err(AuthError::SessionEnded);
        }
        Ok((session.token().to_string(), inner.epoch))
    }

    fn access_denied(&self, role: Role) -> AuthError {
        AuthError::AccessDenied {
            role,
            portal: self.shared.profile.kind,
        }
    }

    fn deny(&self, inner: &mut Inner, role: Role) {
        warn!(role = %role, portal = %self.shared.profile.kind, "Role not allowed on this portal");
        self.sign_out(
            inner,
            Some(Notice::AccessDenied {
                role,
                portal: self.shared.profile.kind,
            }),
        );
    }

    fn sign_in(&self, inner: &mut Inner, session: Session) {
        let user = session.identity().clone();
        let replaced = inner
            .session
            .as_ref()
            .is_some_and(|s| s.identity() != &user);
        inner.epoch += 1;
        inner.refreshing = 0;
        inner.session = Some(session);
        if inner.lifecycle.is_none() {
            inner.lifecycle = Some(self.start_lifecycle());
        }
        self.set_state(inner, AuthState::Authenticated);
        if replaced {
            self.emit(SessionEvent::IdentityChanged(user));
        }
    }

    /// The single exit from a held session. Storage is cleared, background
    /// work stops, and any in-flight response is orphaned by the epoch bump.
    fn sign_out(&self, inner: &mut Inner, notice: Option<Notice>) {
        inner.epoch += 1;
        inner.refreshing = 0;
        inner.session = None;
        self.shared.sessions.clear();
        if let Some(lifecycle) = inner.lifecycle.take() {
            lifecycle.stop();
        }
        self.set_state(inner, AuthState::Unauthenticated);
        if let Some(notice) = notice {
            self.emit(SessionEvent::Notice(notice));
        }
    }

    fn start_lifecycle(&self) -> LifecycleHandle {
        let policy = self.shared.sessions.policy();
        let period = policy.check_interval;

        let weak = Arc::downgrade(&self.shared);
        let checker = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(controller) = Self::upgrade(&weak) else {
                    break;
                };
                controller.periodic_check().await;
            }
        });

        let weak = Arc::downgrade(&self.shared);
        let activity = ActivityMonitor::new(policy.activity_window).start(move || {
            if let Some(controller) = Self::upgrade(&weak) {
                controller.handle_activity();
            }
        });

        debug!(check_interval = ?period, "Lifecycle tasks started");
        LifecycleHandle { checker, activity }
    }

    fn upgrade(weak: &Weak<Shared>) -> Option<SessionController> {
        weak.upgrade().map(|shared| SessionController { shared })
    }

    #[cfg(test)]
    fn has_lifecycle(&self) -> bool {
        self.lock().lifecycle.is_some()
    }

    #[cfg(test)]
    fn session_duration(&self) -> chrono::Duration {
        self.shared.sessions.policy().session_duration
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("SessionController")
            .field("portal", &self.shared.profile.kind)
            .field("state", &inner.state)
            .field("session", &inner.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AuthPayload;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use crate::test_support::{user, MockAuthApi, ReadOnlyStore};
    use chrono::Duration;
    use std::time::Duration as StdDuration;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Fixture {
        controller: SessionController,
        api: Arc<MockAuthApi>,
        memory: Arc<MemoryStore>,
        clock: ManualClock,
    }

    fn fixture(profile: PortalProfile) -> Fixture {
        let api = Arc::new(MockAuthApi::new());
        let memory = Arc::new(MemoryStore::new());
        let clock = ManualClock::default();
        let controller = SessionController::new(
            profile,
            api.clone(),
            memory.clone(),
            Arc::new(clock.clone()),
        );
        Fixture {
            controller,
            api,
            memory,
            clock,
        }
    }

    fn payload(role: Role, token: &str) -> AuthPayload {
        AuthPayload {
            user: user(role),
            token: token.to_string(),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }

    fn notices(events: &[SessionEvent]) -> Vec<Notice> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Notice(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    async fn signed_in(f: &Fixture, role: Role) {
        f.api.push_login(Ok(payload(role, "tok-1")));
        f.controller
            .login(LoginRequest::new("sam@example.com", "pw", false))
            .await
            .unwrap();
    }

    /// Write a session as another window would.
    fn store_for(f: &Fixture) -> SessionStore {
        let profile = f.controller.profile().clone();
        SessionStore::new(
            f.memory.clone(),
            Arc::new(f.clock.clone()),
            profile.keys,
            profile.policy,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_customer_login_without_remember_me() {
        let f = fixture(PortalProfile::customer());
        f.api.push_login(Ok(payload(Role::Customer, "tok-c")));

        let user = f
            .controller
            .login(LoginRequest::new("alice", "secret1", false))
            .await
            .unwrap();

        assert_eq!(user.role, Role::Customer);
        assert_eq!(f.controller.state(), AuthState::Authenticated);
        let session = f.controller.session().unwrap();
        assert_eq!(session.expires_at(), f.clock.now() + Duration::hours(48));
        assert!(f.memory.contains("customer_session"));
        assert!(!f.memory.contains("customer_remember_me"));
        assert!(f.controller.remembered_login().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_customer_login_with_remember_me() {
        let f = fixture(PortalProfile::customer());
        f.api.push_login(Ok(payload(Role::Customer, "tok-c")));

        f.controller
            .login(LoginRequest::new("alice", "secret1", true))
            .await
            .unwrap();

        let remembered = f.controller.remembered_login().unwrap();
        assert_eq!(remembered.login, "alice");
        assert_eq!(remembered.password, "secret1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_without_remember_me_forgets_previous_record() {
        let f = fixture(PortalProfile::customer());
        f.api.push_login(Ok(payload(Role::Customer, "tok-1")));
        f.controller
            .login(LoginRequest::new("alice", "secret1", true))
            .await
            .unwrap();
        f.controller.logout().await;
        assert!(f.controller.remembered_login().is_some());

        f.api.push_login(Ok(payload(Role::Customer, "tok-2")));
        f.controller
            .login(LoginRequest::new("alice", "secret1", false))
            .await
            .unwrap();
        assert!(f.controller.remembered_login().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_login_leaves_storage_untouched() {
        let f = fixture(PortalProfile::customer());
        f.api.push_login(Err(ApiError::Unauthorized(
            "Invalid email or password".to_string(),
        )));

        let err = f
            .controller
            .login(LoginRequest::new("alice", "wrong", true))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Invalid email or password");
        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert_eq!(f.memory.writes(), 0);
        assert!(f.memory.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_credentials_never_reach_the_server() {
        let f = fixture(PortalProfile::staff());
        let err = f
            .controller
            .login(LoginRequest::new("  ", "pw", false))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MissingCredentials));
        assert_eq!(f.api.login_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_with_wrong_role_is_denied() {
        let f = fixture(PortalProfile::staff());
        let mut rx = f.controller.subscribe();
        f.api.push_login(Ok(payload(Role::Customer, "tok-c")));

        let err = f
            .controller
            .login(LoginRequest::new("alice", "secret1", false))
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::AccessDenied { role: Role::Customer, .. }));
        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert!(f.memory.is_empty());
        assert_eq!(
            notices(&drain(&mut rx)),
            vec![Notice::AccessDenied {
                role: Role::Customer,
                portal: crate::config::PortalKind::Staff,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_is_cleared_by_periodic_check() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;
        let mut rx = f.controller.subscribe();

        let expires = f.controller.session().unwrap().expires_at();
        f.clock.set(expires + Duration::minutes(10));
        f.controller.periodic_check().await;
        f.controller.periodic_check().await;

        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert!(f.memory.is_empty());
        assert_eq!(notices(&drain(&mut rx)), vec![Notice::SessionExpired]);
        assert!(!f.controller.has_lifecycle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_refresh_discards_slower_in_flight_response() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;

        let mut renamed = user(Role::Employee);
        renamed.name = "Renamed".to_string();
        // First call is slow and would succeed; second is fast and rejected.
        f.api
            .push_profile_after(StdDuration::from_secs(5), Ok(renamed));
        f.api
            .push_profile(Err(ApiError::Unauthorized(String::new())));

        let slow = f.controller.refresh();
        let fast = async {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            f.controller.refresh().await;
        };
        tokio::join!(slow, fast);

        assert_eq!(f.api.profile_calls(), 2);
        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert!(f.controller.session().is_none());
        assert!(!f.memory.contains("admin_session"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_with_disallowed_role_signs_out() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;
        let mut rx = f.controller.subscribe();
        f.api.push_profile(Ok(user(Role::Customer)));

        f.controller.refresh().await;

        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert!(f.memory.is_empty());
        assert!(notices(&drain(&mut rx))
            .iter()
            .any(|n| matches!(n, Notice::AccessDenied { role: Role::Customer, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_refresh_failure_keeps_session() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Manager).await;
        let mut rx = f.controller.subscribe();
        f.api
            .push_profile(Err(ApiError::ServerError("maintenance".to_string())));

        f.controller.refresh().await;

        assert_eq!(f.controller.state(), AuthState::Authenticated);
        assert!(f.controller.session().is_some());
        assert!(notices(&drain(&mut rx)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_refresh_replaces_identity_and_extends() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;
        let before = f.controller.session().unwrap();

        let mut promoted = user(Role::Manager);
        promoted.name = "Sam Promoted".to_string();
        f.api.push_profile(Ok(promoted.clone()));
        f.clock.advance(Duration::hours(7) + Duration::minutes(30));
        f.controller.periodic_check().await;

        let after = f.controller.session().unwrap();
        assert_eq!(after.identity(), &promoted);
        assert_eq!(after.token(), before.token());
        assert!(after.expires_at() > before.expires_at());
        assert_eq!(f.controller.snapshot().permissions, *Role::Manager.permissions());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_check_outside_threshold_does_not_refresh() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;

        f.clock.advance(Duration::hours(2));
        f.controller.periodic_check().await;

        assert_eq!(f.api.profile_calls(), 0);
        assert_eq!(f.controller.state(), AuthState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_extends_only_past_half_life() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;
        let first = f.controller.session().unwrap();
        let writes = f.memory.writes();

        // Plenty of time left: no write.
        f.clock.advance(Duration::hours(1));
        f.controller.handle_activity();
        assert_eq!(f.memory.writes(), writes);
        assert_eq!(f.controller.session().unwrap(), first);

        // Four hours left of eight: extend.
        f.clock.advance(Duration::hours(3));
        f.controller.handle_activity();
        assert_eq!(f.memory.writes(), writes + 1);
        let extended = f.controller.session().unwrap();
        assert!(extended.expires_at() > first.expires_at());
        assert_eq!(
            extended.expires_at(),
            f.clock.now() + f.controller.session_duration()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounced_activity_extends_through_listener() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;
        let writes = f.memory.writes();

        f.clock.advance(Duration::hours(5));
        for _ in 0..20 {
            f.controller.record_activity(ActivitySignal::Pointer);
            tokio::time::sleep(StdDuration::from_millis(50)).await;
        }
        tokio::time::sleep(StdDuration::from_secs(2)).await;

        assert_eq!(f.memory.writes(), writes + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_check_expires_session() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;
        assert!(f.controller.has_lifecycle());

        f.clock.advance(Duration::hours(9));
        tokio::time::sleep(StdDuration::from_secs(301)).await;

        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert!(!f.controller.has_lifecycle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_clears_session_but_keeps_remember_me() {
        let f = fixture(PortalProfile::customer());
        f.api.push_login(Ok(payload(Role::Customer, "tok-c")));
        f.api.fail_logout();
        f.controller
            .login(LoginRequest::new("alice", "secret1", true))
            .await
            .unwrap();

        f.controller.logout().await;

        assert_eq!(f.api.logout_calls(), 1);
        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert!(!f.memory.contains("customer_session"));
        assert!(f.memory.contains("customer_remember_me"));
        assert!(!f.controller.has_lifecycle());
        assert_eq!(f.controller.permissions(), &Permissions::NONE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_while_signed_out_is_harmless() {
        let f = fixture(PortalProfile::staff());
        f.controller.logout().await;
        f.controller.logout().await;
        assert_eq!(f.api.logout_calls(), 0);
        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_without_stored_session() {
        let f = fixture(PortalProfile::staff());
        let mut rx = f.controller.subscribe();

        f.controller.restore().await;

        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert_eq!(f.api.profile_calls(), 0);
        assert_eq!(
            drain(&mut rx),
            vec![
                SessionEvent::StateChanged(AuthState::Restoring),
                SessionEvent::StateChanged(AuthState::Unauthenticated),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_keeps_cached_identity_when_server_is_down() {
        let f = fixture(PortalProfile::staff());
        store_for(&f).save("tok-stored", user(Role::Admin));
        f.api
            .push_profile(Err(ApiError::ServerError("down".to_string())));

        f.controller.restore().await;

        assert_eq!(f.controller.state(), AuthState::Authenticated);
        assert_eq!(f.controller.current_user().unwrap().role, Role::Admin);
        assert_eq!(f.controller.session().unwrap().token(), "tok-stored");
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_signs_out_on_rejected_token() {
        let f = fixture(PortalProfile::staff());
        store_for(&f).save("tok-stored", user(Role::Admin));
        let mut rx = f.controller.subscribe();
        f.api
            .push_profile(Err(ApiError::Unauthorized(String::new())));

        f.controller.restore().await;

        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert!(f.memory.is_empty());
        assert_eq!(notices(&drain(&mut rx)), vec![Notice::SessionRevoked]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_discards_expired_session() {
        let f = fixture(PortalProfile::staff());
        store_for(&f).save("tok-stored", user(Role::Admin));
        f.clock.advance(Duration::hours(8));
        let mut rx = f.controller.subscribe();

        f.controller.restore().await;

        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert_eq!(f.api.profile_calls(), 0);
        assert!(f.memory.is_empty());
        assert_eq!(notices(&drain(&mut rx)), vec![Notice::SessionExpired]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_adopts_legacy_pair() {
        let f = fixture(PortalProfile::staff());
        f.memory.set("admin_token", "legacy-tok").unwrap();
        f.memory
            .set(
                "admin_user",
                &serde_json::to_string(&user(Role::Employee)).unwrap(),
            )
            .unwrap();
        f.api.push_profile(Ok(user(Role::Employee)));

        f.controller.restore().await;

        assert_eq!(f.controller.state(), AuthState::Authenticated);
        assert_eq!(f.controller.session().unwrap().token(), "legacy-tok");
        assert!(f.memory.contains("admin_session"));
        assert!(!f.memory.contains("admin_token"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_denies_cached_identity_with_wrong_role() {
        let f = fixture(PortalProfile::customer());
        store_for(&f).save("tok-stored", user(Role::Admin));

        f.controller.restore().await;

        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert_eq!(f.api.profile_calls(), 0);
        assert!(f.memory.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_removed_by_another_window() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;
        let mut rx = f.controller.subscribe();

        store_for(&f).clear();
        f.controller.periodic_check().await;

        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert_eq!(notices(&drain(&mut rx)), vec![Notice::SignedOutElsewhere]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_replaced_by_another_window_is_adopted() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;

        let mut other = user(Role::Admin);
        other.id = 77;
        store_for(&f).save("tok-other", other);
        f.controller.periodic_check().await;

        let session = f.controller.session().unwrap();
        assert_eq!(session.token(), "tok-other");
        assert_eq!(session.identity().id, 77);
        assert_eq!(f.controller.state(), AuthState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_call_unauthorized_signs_out() {
        let f = fixture(PortalProfile::customer());
        f.api.push_login(Ok(payload(Role::Customer, "tok-c")));
        f.controller
            .login(LoginRequest::new("alice", "secret1", true))
            .await
            .unwrap();

        let seen = f
            .controller
            .authorized(|token| async move { Ok::<_, ApiError>(token) })
            .await
            .unwrap();
        assert_eq!(seen, "tok-c");

        let err = f
            .controller
            .authorized(|_| async { Err::<(), _>(ApiError::Unauthorized(String::new())) })
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::SessionEnded));
        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert!(f.memory.contains("customer_remember_me"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_call_requires_session() {
        let f = fixture(PortalProfile::staff());
        let err = f
            .controller
            .authorized(|_| async { Ok::<_, ApiError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NotSignedIn));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_profile_persists_new_identity() {
        let f = fixture(PortalProfile::customer());
        f.api.push_login(Ok(payload(Role::Customer, "tok-c")));
        f.controller
            .login(LoginRequest::new("alice", "secret1", false))
            .await
            .unwrap();

        let mut updated = user(Role::Customer);
        updated.phone = Some("555-0199".to_string());
        f.api.push_update(Ok(updated.clone()));

        let result = f
            .controller
            .update_profile(ProfileUpdate {
                phone: Some("555-0199".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(result, updated);
        assert_eq!(f.controller.current_user(), Some(updated.clone()));
        assert_eq!(store_for(&f).load().unwrap().identity(), &updated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_signs_in() {
        let f = fixture(PortalProfile::customer());
        f.api.push_register(Ok(payload(Role::Customer, "tok-new")));

        let user = f
            .controller
            .register(Registration {
                name: "Alice Baker".to_string(),
                email: "alice@example.com".to_string(),
                password: "secret1".to_string(),
                phone: None,
                company: None,
            })
            .await
            .unwrap();

        assert_eq!(user.role, Role::Customer);
        assert_eq!(f.controller.state(), AuthState::Authenticated);
        assert!(f.memory.contains("customer_session"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_unauthorized() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Admin).await;
        let mut rx = f.controller.subscribe();

        f.controller.report_unauthorized();
        f.controller.report_unauthorized();

        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert_eq!(notices(&drain(&mut rx)), vec![Notice::SessionRevoked]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_discards_in_flight_refresh() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;
        f.api
            .push_profile_after(StdDuration::from_secs(2), Ok(user(Role::Employee)));

        let refresh = f.controller.refresh();
        let logout = async {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
            f.controller.logout().await;
        };
        tokio::join!(refresh, logout);

        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert!(f.memory.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_after_logout_elsewhere_does_not_restore_session() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;
        let mut rx = f.controller.subscribe();

        f.clock.advance(Duration::hours(5));
        store_for(&f).clear();
        f.controller.handle_activity();
        f.controller.periodic_check().await;

        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert!(!f.memory.contains("admin_session"));
        assert_eq!(notices(&drain(&mut rx)), vec![Notice::SignedOutElsewhere]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_never_overwrites_newer_login_elsewhere() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;

        f.clock.advance(Duration::hours(5));
        let mut other = user(Role::Admin);
        other.id = 77;
        store_for(&f).save("tok-other", other);
        f.controller.handle_activity();

        assert_eq!(store_for(&f).load().unwrap().token(), "tok-other");
        assert_eq!(f.controller.session().unwrap().token(), "tok-other");
        assert_eq!(f.controller.state(), AuthState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwritable_storage_keeps_session_through_checks() {
        let api = Arc::new(MockAuthApi::new());
        let clock = ManualClock::default();
        let controller = SessionController::new(
            PortalProfile::staff(),
            api.clone(),
            Arc::new(ReadOnlyStore),
            Arc::new(clock.clone()),
        );
        let mut rx = controller.subscribe();
        api.push_login(Ok(payload(Role::Employee, "tok-1")));
        controller
            .login(LoginRequest::new("sam@example.com", "pw", false))
            .await
            .unwrap();

        clock.advance(Duration::minutes(5));
        controller.periodic_check().await;
        clock.advance(Duration::hours(5));
        controller.handle_activity();
        controller.periodic_check().await;

        assert_eq!(controller.state(), AuthState::Authenticated);
        assert!(notices(&drain(&mut rx)).is_empty());
        assert_eq!(
            controller.session().unwrap().expires_at(),
            clock.now() + Duration::hours(8)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_with_whitespace_is_stable_across_checks() {
        let f = fixture(PortalProfile::staff());
        f.api.push_login(Ok(payload(Role::Employee, "tok ")));
        f.controller
            .login(LoginRequest::new("sam@example.com", "pw", false))
            .await
            .unwrap();
        let mut rx = f.controller.subscribe();

        f.clock.advance(Duration::minutes(10));
        f.controller.periodic_check().await;

        assert!(drain(&mut rx).is_empty());
        assert_eq!(f.controller.session().unwrap().token(), "tok ");
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_profile_unauthorized_signs_out() {
        let f = fixture(PortalProfile::customer());
        f.api.push_login(Ok(payload(Role::Customer, "tok-c")));
        f.controller
            .login(LoginRequest::new("alice", "secret1", false))
            .await
            .unwrap();
        let mut rx = f.controller.subscribe();
        f.api.push_update(Err(ApiError::Unauthorized(String::new())));

        let err = f
            .controller
            .update_profile(ProfileUpdate {
                name: Some("Alice B.".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::SessionEnded));
        assert_eq!(f.controller.state(), AuthState::Unauthenticated);
        assert!(!f.memory.contains("customer_session"));
        assert_eq!(notices(&drain(&mut rx)), vec![Notice::SessionRevoked]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_for_old_token_keeps_newer_session() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;

        let stale = f.controller.authorized(|_| async {
            tokio::time::sleep(StdDuration::from_secs(2)).await;
            Err::<(), _>(ApiError::Unauthorized(String::new()))
        });
        let relogin = async {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
            f.controller.logout().await;
            f.api.push_login(Ok(payload(Role::Employee, "tok-2")));
            f.controller
                .login(LoginRequest::new("sam@example.com", "pw", false))
                .await
                .unwrap();
        };
        let (result, _) = tokio::join!(stale, relogin);

        assert!(matches!(result, Err(AuthError::SessionEnded)));
        assert_eq!(f.controller.state(), AuthState::Authenticated);
        assert_eq!(f.controller.session().unwrap().token(), "tok-2");
        assert!(f.memory.contains("admin_session"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_refreshes_stay_refreshing_until_last_lands() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;
        f.api
            .push_profile_after(StdDuration::from_secs(1), Ok(user(Role::Employee)));
        f.api
            .push_profile_after(StdDuration::from_secs(3), Ok(user(Role::Employee)));

        let first = f.controller.refresh();
        let second = async {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            f.controller.refresh().await;
        };
        let midway = async {
            tokio::time::sleep(StdDuration::from_millis(1500)).await;
            f.controller.state()
        };
        let (_, _, midway) = tokio::join!(first, second, midway);

        assert_eq!(midway, AuthState::Refreshing);
        assert_eq!(f.controller.state(), AuthState::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_updated_by_another_window_is_announced() {
        let f = fixture(PortalProfile::staff());
        signed_in(&f, Role::Employee).await;
        let mut rx = f.controller.subscribe();

        let mut renamed = user(Role::Employee);
        renamed.name = "Sam O.".to_string();
        f.clock.advance(Duration::minutes(1));
        store_for(&f).save("tok-1", renamed.clone());
        f.controller.periodic_check().await;

        assert_eq!(f.controller.current_user(), Some(renamed.clone()));
        assert_eq!(drain(&mut rx), vec![SessionEvent::IdentityChanged(renamed)]);
    }
}
