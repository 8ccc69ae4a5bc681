//! String encoding of stored sessions.
//!
//! Current format (one key):
//!
//! ```json
//! {"token": "...", "user": {...}, "createdAt": "2026-01-02T03:04:05.678Z", "expiresAt": "..."}
//! ```
//!
//! Older portal builds wrote `createdAt`/`expiresAt` as epoch milliseconds;
//! both forms are read. Before that, the token and user lived under two
//! separate keys with no expiry at all (the legacy format).

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::UserRecord;

use super::session::Session;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed session blob: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("stored session has an empty token")]
    EmptyToken,

    #[error("stored timestamp {0} is out of range")]
    TimestampOutOfRange(i64),

    #[error("stored session expires at {expires_at}, not after its creation at {created_at}")]
    ExpiryNotAfterCreation {
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StoredSessionRef<'a> {
    token: &'a str,
    user: &'a UserRecord,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSession {
    token: String,
    user: UserRecord,
    created_at: StoredInstant,
    expires_at: StoredInstant,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredInstant {
    Rfc3339(DateTime<Utc>),
    EpochMillis(i64),
}

impl StoredInstant {
    fn into_datetime(self) -> Result<DateTime<Utc>, CodecError> {
        match self {
            StoredInstant::Rfc3339(dt) => Ok(dt),
            StoredInstant::EpochMillis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or(CodecError::TimestampOutOfRange(ms)),
        }
    }
}

pub struct SessionCodec;

impl SessionCodec {
    pub fn encode(session: &Session) -> Result<String, CodecError> {
        let stored = StoredSessionRef {
            token: session.token(),
            user: session.identity(),
            created_at: session.created_at(),
            expires_at: session.expires_at(),
        };
        Ok(serde_json::to_string(&stored)?)
    }

    pub fn decode(blob: &str) -> Result<Session, CodecError> {
        let stored: StoredSession = serde_json::from_str(blob)?;
        let token = Self::check_token(stored.token)?;
        let created_at = stored.created_at.into_datetime()?;
        let expires_at = stored.expires_at.into_datetime()?;
        Session::from_parts(token, stored.user, created_at, expires_at)
            .ok_or(CodecError::ExpiryNotAfterCreation {
                created_at,
                expires_at,
            })
    }

    /// Decode the two legacy keys. The token was written either raw or as a
    /// JSON string; the user as bare JSON.
    pub fn decode_legacy(token_blob: &str, user_blob: &str) -> Result<(String, UserRecord), CodecError> {
        // Raw blobs may carry the newline of whatever wrote them.
        let token = serde_json::from_str::<String>(token_blob)
            .unwrap_or_else(|_| token_blob.trim().to_string());
        let token = Self::check_token(token)?;
        let user: UserRecord = serde_json::from_str(user_blob)?;
        Ok((token, user))
    }

    /// Rejects blank tokens. Others are kept byte for byte.
    fn check_token(token: String) -> Result<String, CodecError> {
        if token.trim().is_empty() {
            Err(CodecError::EmptyToken)
        } else {
            Ok(token)
        }
    }
}
