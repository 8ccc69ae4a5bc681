//! Persisted authentication state.
//!
//! This module provides:
//! - `Session` / `SessionStore`: the cached identity and bearer token with
//!   its own expiry, persisted under the portal's session key
//! - `SessionCodec`: the stored string format, including the legacy
//!   two-key format older builds wrote
//! - `CredentialVault`: the optional, separately expiring remember-me record
//!
//! Nothing here talks to the network; the lifecycle controller decides when
//! to save, extend, and clear.

pub mod codec;
pub mod session;
pub mod vault;

pub use codec::{CodecError, SessionCodec};
pub use session::{Session, SessionStore};
pub use vault::{CredentialVault, RememberedLogin};
