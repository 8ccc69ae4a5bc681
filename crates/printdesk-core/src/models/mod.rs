//! Data models for portal identities.
//!
//! This module contains:
//!
//! - `UserRecord`: the cached profile of the signed-in identity, validated
//!   at the wire boundary
//! - `Role` and `Permissions`: the role variants and their fixed capability
//!   records
//! - `ProfileUpdate`: the partial identity sent when a user edits a profile

pub mod role;
pub mod user;

pub use role::{Permissions, Role};
pub use user::{InvalidUserRecord, ProfileUpdate, UserRecord};
