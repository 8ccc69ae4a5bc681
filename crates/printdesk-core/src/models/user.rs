//! The signed-in identity.
//!
//! API responses are loosely shaped, so `UserRecord` is never deserialized
//! directly from the wire: it goes through `WireUser` (every field optional)
//! and a validation step. A payload missing a required field is rejected as a
//! whole rather than producing a half-filled record.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Permissions, Role};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidUserRecord {
    #[error("user record is missing field `{0}`")]
    MissingField(&'static str),

    #[error("user record has invalid id {0}")]
    InvalidId(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "WireUser")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserRecord {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[cfg_attr(feature = "ts", ts(type = "string"))]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl UserRecord {
    pub fn permissions(&self) -> &'static Permissions {
        self.role.permissions()
    }

    /// First name for greetings, falling back to the full display name.
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }
}

/// Unvalidated wire shape of a user.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireUser {
    id: Option<i64>,
    #[serde(alias = "displayName", alias = "fullName")]
    name: Option<String>,
    email: Option<String>,
    role: Option<Role>,
    phone: Option<String>,
    #[serde(alias = "companyName")]
    company: Option<String>,
    #[serde(alias = "avatar")]
    avatar_url: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl TryFrom<WireUser> for UserRecord {
    type Error = InvalidUserRecord;

    fn try_from(wire: WireUser) -> Result<Self, Self::Error> {
        let id = wire.id.ok_or(InvalidUserRecord::MissingField("id"))?;
        if id <= 0 {
            return Err(InvalidUserRecord::InvalidId(id));
        }
        let name = non_empty(wire.name).ok_or(InvalidUserRecord::MissingField("name"))?;
        let email = non_empty(wire.email).ok_or(InvalidUserRecord::MissingField("email"))?;
        let role = wire.role.ok_or(InvalidUserRecord::MissingField("role"))?;

        Ok(UserRecord {
            id,
            name,
            email,
            role,
            phone: non_empty(wire.phone),
            company: non_empty(wire.company),
            avatar_url: non_empty(wire.avatar_url),
        })
    }
}

/// Partial identity sent with `PUT /auth/profile`. Unset fields are left
/// unchanged by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self == &ProfileUpdate::default()
    }
}
