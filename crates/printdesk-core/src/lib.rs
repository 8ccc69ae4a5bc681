//! Printdesk core - client-side session lifecycle for the print-shop portals.
//!
//! The staff and customer portals each run one `SessionController`. It signs
//! users in against the REST backend, keeps the session in persistent storage
//! with a sliding expiry, re-validates it in the background, and tells the
//! host what happened through `SessionEvent`s.

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod lifecycle;
pub mod models;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use api::{ApiClient, ApiError, AuthApi, AuthPayload, Registration};
pub use auth::{RememberedLogin, Session};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, PortalKind, PortalProfile};
pub use lifecycle::{
    ActivitySignal, AuthError, AuthSnapshot, AuthState, LoginRequest, Notice, SessionController,
    SessionEvent,
};
pub use models::{Permissions, ProfileUpdate, Role, UserRecord};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
