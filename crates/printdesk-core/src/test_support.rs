//! Scripted backend for controller tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::{ApiError, AuthApi, AuthPayload, Registration};
use crate::models::{ProfileUpdate, Role, UserRecord};
use crate::storage::{KeyValueStore, StorageError};

pub fn user(role: Role) -> UserRecord {
    UserRecord {
        id: 9,
        name: "Sam Ortiz".to_string(),
        email: "sam@example.com".to_string(),
        role,
        phone: None,
        company: None,
        avatar_url: None,
    }
}

/// A store that reads as empty and refuses every write, like a full disk.
pub struct ReadOnlyStore;

impl KeyValueStore for ReadOnlyStore {
    fn get(&self, _key: &str) -> Result<Option<String>, StorageError> {
        Ok(None)
    }

    fn set(&self, key: &str, _value: &str) -> Result<(), StorageError> {
        Err(StorageError::Io {
            key: key.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        })
    }

    fn remove(&self, _key: &str) -> Result<(), StorageError> {
        Ok(())
    }
}

struct Scripted<T> {
    delay: Duration,
    result: Result<T, ApiError>,
}

type Queue<T> = Mutex<VecDeque<Scripted<T>>>;

/// Each endpoint answers from its own queue, in push order. An empty queue
/// answers with a server error.
#[derive(Default)]
pub struct MockAuthApi {
    logins: Queue<AuthPayload>,
    registrations: Queue<AuthPayload>,
    profiles: Queue<UserRecord>,
    updates: Queue<UserRecord>,
    logout_fails: AtomicBool,
    login_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    profile_calls: AtomicUsize,
}

fn push<T>(queue: &Queue<T>, delay: Duration, result: Result<T, ApiError>) {
    queue
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push_back(Scripted { delay, result });
}

async fn answer<T>(queue: &Queue<T>) -> Result<T, ApiError> {
    let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
    match next {
        Some(Scripted { delay, result }) => {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result
        }
        None => Err(ApiError::ServerError("no scripted response".to_string())),
    }
}

impl MockAuthApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_login(&self, result: Result<AuthPayload, ApiError>) {
        push(&self.logins, Duration::ZERO, result);
    }

    pub fn push_register(&self, result: Result<AuthPayload, ApiError>) {
        push(&self.registrations, Duration::ZERO, result);
    }

    pub fn push_profile(&self, result: Result<UserRecord, ApiError>) {
        push(&self.profiles, Duration::ZERO, result);
    }

    pub fn push_profile_after(&self, delay: Duration, result: Result<UserRecord, ApiError>) {
        push(&self.profiles, delay, result);
    }

    pub fn push_update(&self, result: Result<UserRecord, ApiError>) {
        push(&self.updates, Duration::ZERO, result);
    }

    pub fn fail_logout(&self) {
        self.logout_fails.store(true, Ordering::SeqCst);
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    pub fn profile_calls(&self) -> usize {
        self.profile_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthApi for MockAuthApi {
    async fn login(&self, _login: &str, _password: &str) -> Result<AuthPayload, ApiError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        answer(&self.logins).await
    }

    async fn register(&self, _registration: &Registration) -> Result<AuthPayload, ApiError> {
        answer(&self.registrations).await
    }

    async fn logout(&self, _token: &str) -> Result<(), ApiError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if self.logout_fails.load(Ordering::SeqCst) {
            Err(ApiError::ServerError("logout unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    async fn fetch_profile(&self, _token: &str) -> Result<UserRecord, ApiError> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        answer(&self.profiles).await
    }

    async fn update_profile(
        &self,
        _token: &str,
        _update: &ProfileUpdate,
    ) -> Result<UserRecord, ApiError> {
        answer(&self.updates).await
    }
}
