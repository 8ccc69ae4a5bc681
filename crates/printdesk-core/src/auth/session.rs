use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{SessionPolicy, StorageKeys};
use crate::models::UserRecord;
use crate::storage::KeyValueStore;

use super::codec::SessionCodec;

/// A signed-in identity held client-side, with its own expiry.
///
/// `expires_at > created_at` holds for every value of this type; the
/// constructors refuse anything else.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    token: String,
    identity: UserRecord,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn new(
        token: String,
        identity: UserRecord,
        created_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let duration = duration.max(Duration::milliseconds(1));
        Self {
            token,
            identity,
            created_at,
            expires_at: created_at + duration,
        }
    }

    pub(crate) fn from_parts(
        token: String,
        identity: UserRecord,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Option<Self> {
        (expires_at > created_at).then_some(Self {
            token,
            identity,
            created_at,
            expires_at,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn identity(&self) -> &UserRecord {
        &self.identity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("user_id", &self.identity.id)
            .field("role", &self.identity.role)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Owner of a portal's canonical session slot.
///
/// Storage failures never escape: a failed or unparseable read is an absent
/// session. A failed write is logged and `in_sync` reports false until a
/// later save or clear succeeds; until then the caller's in-memory value is
/// the source of truth.
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    keys: StorageKeys,
    policy: SessionPolicy,
    /// Creation time of the last session issued, so repeated saves within
    /// one clock tick still extend the expiry.
    last_issued: Mutex<Option<DateTime<Utc>>>,
    /// Set when the last save did not reach storage.
    unsynced: AtomicBool,
}

impl SessionStore {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        keys: StorageKeys,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            keys,
            policy,
            last_issued: Mutex::new(None),
            unsynced: AtomicBool::new(false),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    fn issue_time(&self) -> DateTime<Utc> {
        let mut last = self.last_issued.lock().unwrap_or_else(PoisonError::into_inner);
        let mut now = self.clock.now();
        if let Some(prev) = *last {
            if now <= prev {
                now = prev + Duration::microseconds(1);
            }
        }
        *last = Some(now);
        now
    }

    /// Create a session expiring one full session duration from now and
    /// persist it.
    pub fn save(&self, token: &str, identity: UserRecord) -> Session {
        let session = Session::new(
            token.to_string(),
            identity,
            self.issue_time(),
            self.policy.session_duration,
        );
        self.write(&session);
        session
    }

    /// Same token and identity, fresh expiry.
    pub fn extend(&self, session: &Session) -> Session {
        self.save(session.token(), session.identity().clone())
    }

    fn write(&self, session: &Session) {
        let blob = match SessionCodec::encode(session) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "Failed to encode session");
                self.unsynced.store(true, Ordering::SeqCst);
                return;
            }
        };
        match self.store.set(self.keys.session, &blob) {
            Ok(()) => {
                self.unsynced.store(false, Ordering::SeqCst);
                debug!(expires_at = %session.expires_at(), "Session saved");
            }
            Err(e) => {
                self.unsynced.store(true, Ordering::SeqCst);
                warn!(error = %e, "Failed to save session");
            }
        }
    }

    /// False while the last save has not reached storage. An absent stored
    /// session then says nothing about other windows.
    pub fn in_sync(&self) -> bool {
        !self.unsynced.load(Ordering::SeqCst)
    }

    pub fn load(&self) -> Option<Session> {
        match self.store.get(self.keys.session) {
            Ok(Some(blob)) => match SessionCodec::decode(&blob) {
                Ok(session) => return Some(session),
                Err(e) => warn!(error = %e, "Stored session is unreadable, ignoring it"),
            },
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Failed to read session");
                return None;
            }
        }
        self.load_legacy()
    }

    /// Older builds stored a bare token and a bare user with no expiry.
    /// Such a pair is adopted as a fresh session and rewritten in the
    /// current format, unless the policy says to discard it.
    fn load_legacy(&self) -> Option<Session> {
        let token_blob = self.read_quietly(self.keys.legacy_token)?;
        let user_blob = self.read_quietly(self.keys.legacy_user)?;

        if !self.policy.adopt_legacy_sessions {
            info!("Discarding legacy session");
            self.remove_legacy();
            return None;
        }

        match SessionCodec::decode_legacy(&token_blob, &user_blob) {
            Ok((token, identity)) => {
                let session = self.save(&token, identity);
                self.remove_legacy();
                info!(user_id = session.identity().id, "Migrated legacy session");
                Some(session)
            }
            Err(e) => {
                warn!(error = %e, "Legacy session is unreadable, ignoring it");
                None
            }
        }
    }

    fn read_quietly(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                debug!(key = key, error = %e, "Failed to read key");
                None
            }
        }
    }

    fn remove_quietly(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            warn!(key = key, error = %e, "Failed to remove key");
        }
    }

    fn remove_legacy(&self) {
        self.remove_quietly(self.keys.legacy_token);
        self.remove_quietly(self.keys.legacy_user);
    }

    /// Remove the canonical and legacy keys. Idempotent.
    pub fn clear(&self) {
        self.remove_quietly(self.keys.session);
        self.remove_legacy();
        self.unsynced.store(false, Ordering::SeqCst);
        debug!("Session cleared");
    }

    pub fn is_valid(&self, session: &Session) -> bool {
        self.now() < session.expires_at()
    }

    pub fn remaining(&self, session: &Session) -> Duration {
        session.expires_at() - self.now()
    }

    /// True only inside `(0, refresh_threshold]`; an expired session is a
    /// different signal.
    pub fn needs_refresh(&self, session: &Session) -> bool {
        let remaining = self.remaining(session);
        remaining > Duration::zero() && remaining <= self.policy.refresh_threshold
    }
}
