//! API client for the print-shop REST backend.
//!
//! This module provides the `ApiClient` struct, which implements `AuthApi`
//! and offers generic authenticated JSON requests for the rest of the API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::models::{ProfileUpdate, UserRecord};

use super::{ApiError, AuthApi, AuthPayload, Registration};

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Serialize)]
struct LoginBody<'a> {
    login: &'a str,
    password: &'a str,
}

/// `GET`/`PUT /auth/profile` responses come either wrapped or bare.
#[derive(Deserialize)]
#[serde(untagged)]
enum ProfileBody {
    Wrapped { user: UserRecord },
    Bare(UserRecord),
}

impl ProfileBody {
    fn into_user(self) -> UserRecord {
        match self {
            ProfileBody::Wrapped { user } | ProfileBody::Bare(user) => user,
        }
    }
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Send a request, retrying 429s with exponential backoff.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<&B>,
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.url(path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .request(method.clone(), &url)
                .header(header::ACCEPT, "application/json");
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request.send().await?;
            match Self::check_response_for_retry(response).await? {
                Some(response) => return Ok(response),
                None => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = %url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2;
                }
            }
        }
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response, what: &str) -> Result<T, ApiError> {
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| {
            debug!(error = %e, "Unparseable response body");
            ApiError::InvalidResponse(format!("Failed to parse {} response: {}", what, e))
        })
    }

    /// Authenticated `GET` of any JSON resource.
    pub async fn get<T: DeserializeOwned>(&self, path: &str, token: &str) -> Result<T, ApiError> {
        let response = self.send::<()>(Method::GET, path, Some(token), None).await?;
        Self::parse(response, path).await
    }

    /// Authenticated `POST` with a JSON body.
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        token: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self.send(Method::POST, path, Some(token), Some(body)).await?;
        Self::parse(response, path).await
    }

    /// Authenticated `PUT` with a JSON body.
    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        token: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let response = self.send(Method::PUT, path, Some(token), Some(body)).await?;
        Self::parse(response, path).await
    }

    fn check_payload(payload: AuthPayload) -> Result<AuthPayload, ApiError> {
        if payload.token.trim().is_empty() {
            return Err(ApiError::InvalidResponse("Auth response carried an empty token".to_string()));
        }
        Ok(payload)
    }
}

#[async_trait]
impl AuthApi for ApiClient {
    async fn login(&self, login: &str, password: &str) -> Result<AuthPayload, ApiError> {
        let body = LoginBody { login, password };
        let response = self.send(Method::POST, "auth/login", None, Some(&body)).await?;
        let payload: AuthPayload = Self::parse(response, "login").await?;
        Self::check_payload(payload)
    }

    async fn register(&self, registration: &Registration) -> Result<AuthPayload, ApiError> {
        let response = self
            .send(Method::POST, "auth/register", None, Some(registration))
            .await?;
        let payload: AuthPayload = Self::parse(response, "register").await?;
        Self::check_payload(payload)
    }

    async fn logout(&self, token: &str) -> Result<(), ApiError> {
        self.send::<()>(Method::POST, "auth/logout", Some(token), None)
            .await
            .map(|_| ())
    }

    async fn fetch_profile(&self, token: &str) -> Result<UserRecord, ApiError> {
        let body: ProfileBody = self.get("auth/profile", token).await?;
        Ok(body.into_user())
    }

    async fn update_profile(
        &self,
        token: &str,
        update: &ProfileUpdate,
    ) -> Result<UserRecord, ApiError> {
        let body: ProfileBody = self.put("auth/profile", token, update).await?;
        Ok(body.into_user())
    }
}
