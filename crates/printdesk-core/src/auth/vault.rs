//! Remember-me credential cache.
//!
//! Stores a login and password so the sign-in form can be prefilled. The
//! password is obfuscated, not encrypted: the transform only keeps the
//! plaintext out of the stored blob and is trivially reversible by anyone
//! who reads this code. It is NOT a security boundary.
//!
//! The record has its own lifetime (`max_remember_age`) and is independent
//! of the session: neither clears the other.

use std::fmt;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::wipe;
use crate::clock::Clock;
use crate::storage::KeyValueStore;

/// Per-record random salt length in bytes
const SALT_LEN: usize = 8;

/// Fixed pad mixed into every byte
const PAD: &[u8] = b"printdesk/remember-me/v1";

#[derive(Error, Debug)]
enum VaultError {
    #[error("malformed remember-me record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("password blob is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("password blob is too short")]
    Truncated,

    #[error("password blob does not decode to UTF-8")]
    NotUtf8,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RememberMeRecord {
    login: String,
    obfuscated_password: String,
    saved_at: DateTime<Utc>,
}

/// A remembered login, used only to prefill the sign-in form.
#[derive(Clone, PartialEq, Eq)]
pub struct RememberedLogin {
    pub login: String,
    pub password: String,
}

impl fmt::Debug for RememberedLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RememberedLogin")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Drop for RememberedLogin {
    fn drop(&mut self) {
        wipe(&mut self.password);
    }
}

fn mask(salt: &[u8; SALT_LEN], i: usize) -> u8 {
    salt[i % SALT_LEN] ^ PAD[i % PAD.len()] ^ (i as u8).wrapping_mul(31)
}

fn obfuscate(password: &str) -> String {
    let salt: [u8; SALT_LEN] = rand::random();
    let mut bytes = Vec::with_capacity(SALT_LEN + password.len());
    bytes.extend_from_slice(&salt);
    bytes.extend(
        password
            .bytes()
            .enumerate()
            .map(|(i, b)| b ^ mask(&salt, i)),
    );
    STANDARD.encode(bytes)
}

fn reveal(encoded: &str) -> Result<String, VaultError> {
    let bytes = STANDARD.decode(encoded)?;
    if bytes.len() < SALT_LEN {
        return Err(VaultError::Truncated);
    }
    let (salt, body) = bytes.split_at(SALT_LEN);
    let mut salt_arr = [0u8; SALT_LEN];
    salt_arr.copy_from_slice(salt);
    let plain: Vec<u8> = body
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ mask(&salt_arr, i))
        .collect();
    String::from_utf8(plain).map_err(|_| VaultError::NotUtf8)
}

pub struct CredentialVault {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    key: &'static str,
    max_age: Duration,
}

impl CredentialVault {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        key: &'static str,
        max_age: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            key,
            max_age,
        }
    }

    pub fn save(&self, login: &str, password: &str) {
        let record = RememberMeRecord {
            login: login.to_string(),
            obfuscated_password: obfuscate(password),
            saved_at: self.clock.now(),
        };
        let blob = match serde_json::to_string(&record) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "Failed to encode remember-me record");
                return;
            }
        };
        match self.store.set(self.key, &blob) {
            Ok(()) => debug!("Remember-me record saved"),
            Err(e) => warn!(error = %e, "Failed to save remember-me record"),
        }
    }

    /// The remembered login, or `None` if there is none, it is unreadable,
    /// or it is older than the maximum age. The last two are purged.
    pub fn load(&self) -> Option<RememberedLogin> {
        let blob = match self.store.get(self.key) {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read remember-me record");
                return None;
            }
        };

        let record: RememberMeRecord = match serde_json::from_str(&blob) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %VaultError::from(e), "Purging unreadable remember-me record");
                self.clear();
                return None;
            }
        };

        if self.clock.now() - record.saved_at > self.max_age {
            info!(saved_at = %record.saved_at, "Remember-me record expired, purging");
            self.clear();
            return None;
        }

        match reveal(&record.obfuscated_password) {
            Ok(password) => Some(RememberedLogin {
                login: record.login,
                password,
            }),
            Err(e) => {
                warn!(error = %e, "Purging unreadable remember-me record");
                self.clear();
                None
            }
        }
    }

    pub fn clear(&self) {
        if let Err(e) = self.store.remove(self.key) {
            warn!(error = %e, "Failed to remove remember-me record");
        }
    }
}
