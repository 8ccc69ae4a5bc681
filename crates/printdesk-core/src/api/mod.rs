//! REST API seam for the print-shop backend.
//!
//! This module provides:
//! - `AuthApi`: the four auth endpoints (plus registration) the session
//!   lifecycle depends on, as an async trait so the controller can be driven
//!   by a scripted backend in tests
//! - `ApiClient`: the `reqwest` implementation, which also exposes generic
//!   authenticated JSON helpers for every other endpoint
//! - `ApiError`: HTTP failure taxonomy with the 401 distinction the
//!   lifecycle relies on
//!
//! The API uses bearer token authentication obtained from `POST /auth/login`.

pub mod client;
pub mod error;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{ProfileUpdate, UserRecord};

pub use client::ApiClient;
pub use error::ApiError;

/// Successful login or registration response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthPayload {
    pub user: UserRecord,
    #[serde(alias = "accessToken")]
    pub token: String,
}

/// New customer account details for `POST /auth/register`.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        wipe(&mut self.password);
    }
}

/// Overwrite a secret's bytes in place before the buffer is released.
pub(crate) fn wipe(secret: &mut String) {
    let len = secret.len();
    secret.clear();
    secret.extend(std::iter::repeat('\0').take(len));
    secret.clear();
}

#[async_trait]
pub trait AuthApi: Send + Sync + 'static {
    /// `POST /auth/login`
    async fn login(&self, login: &str, password: &str) -> Result<AuthPayload, ApiError>;

    /// `POST /auth/register`
    async fn register(&self, registration: &Registration) -> Result<AuthPayload, ApiError>;

    /// `POST /auth/logout`. Callers ignore the outcome.
    async fn logout(&self, token: &str) -> Result<(), ApiError>;

    /// `GET /auth/profile`
    async fn fetch_profile(&self, token: &str) -> Result<UserRecord, ApiError>;

    /// `PUT /auth/profile`
    async fn update_profile(
        &self,
        token: &str,
        update: &ProfileUpdate,
    ) -> Result<UserRecord, ApiError>;
}
