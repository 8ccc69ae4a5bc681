use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::api::{wipe, ApiError};
use crate::config::PortalKind;
use crate::models::{Permissions, Role, UserRecord};

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum AuthState {
    Unauthenticated,
    /// Startup check in progress. The only state a host should show a
    /// loading indicator for.
    Restoring,
    Authenticated,
    /// Authenticated, with a profile re-fetch in flight.
    Refreshing,
}

impl AuthState {
    /// Authenticated or refreshing: a session is held.
    pub fn is_signed_in(self) -> bool {
        matches!(self, AuthState::Authenticated | AuthState::Refreshing)
    }
}

/// User-facing messages produced by the lifecycle itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The session ran out locally.
    SessionExpired,
    /// The backend rejected the token (401).
    SessionRevoked,
    /// The identity's role may not use this portal.
    AccessDenied { role: Role, portal: PortalKind },
    /// Another window sharing this storage signed out.
    SignedOutElsewhere,
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Notice::SessionExpired => "Your session has expired. Please sign in again.".to_string(),
            Notice::SessionRevoked => {
                "Your session is no longer valid. Please sign in again.".to_string()
            }
            Notice::AccessDenied { role, portal } => format!(
                "{} accounts cannot use the {} portal.",
                role.display_name(),
                portal
            ),
            Notice::SignedOutElsewhere => "You were signed out in another window.".to_string(),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Broadcast to every `SessionController::subscribe` receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(AuthState),
    /// The signed-in identity was replaced (refresh, profile update, or a
    /// session adopted from another window). Re-read the snapshot.
    IdentityChanged(UserRecord),
    Notice(Notice),
}

/// Everything a UI needs to render auth-dependent chrome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSnapshot {
    pub state: AuthState,
    pub user: Option<UserRecord>,
    pub permissions: Permissions,
}

impl AuthSnapshot {
    pub fn is_signed_in(&self) -> bool {
        self.state.is_signed_in()
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Please enter your login and password")]
    MissingCredentials,

    /// The backend refused the request; the message is the server's own.
    #[error("{0}")]
    Rejected(String),

    #[error("{} accounts cannot use the {portal} portal", .role.display_name())]
    AccessDenied { role: Role, portal: PortalKind },

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Your session has ended. Please sign in again.")]
    SessionEnded,

    #[error("{}", .0.user_message())]
    Unavailable(#[source] ApiError),
}

impl AuthError {
    /// Errors the backend decided on carry its message; transport and server
    /// failures keep the underlying error.
    pub(crate) fn from_api(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized(ref m)
            | ApiError::AccessDenied(ref m)
            | ApiError::BadRequest(ref m)
            | ApiError::NotFound(ref m)
                if !m.is_empty() =>
            {
                AuthError::Rejected(m.clone())
            }
            ApiError::Unauthorized(_) => {
                AuthError::Rejected("Invalid login or password".to_string())
            }
            other => AuthError::Unavailable(other),
        }
    }
}

/// Sign-in form contents. The password is wiped when this is dropped, so a
/// request handed to `SessionController::login` leaves no copy behind.
pub struct LoginRequest {
    pub login: String,
    pub password: String,
    pub remember_me: bool,
}

impl LoginRequest {
    pub fn new(login: impl Into<String>, password: impl Into<String>, remember_me: bool) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
            remember_me,
        }
    }
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginRequest")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("remember_me", &self.remember_me)
            .finish()
    }
}

impl Drop for LoginRequest {
    fn drop(&mut self) {
        wipe(&mut self.password);
    }
}
