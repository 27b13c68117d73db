//! Authentication state for one execution context.
//!
//! This module provides:
//! - `TokenStore` and its keychain, file and in-memory backends
//! - `Claims`: unverified decoding of access-token claims
//! - `RequiredCapability` and `evaluate`: permission/role gating
//! - `Session`: the signed-in user
//! - `AuthContext`: sign-in, sign-out, restore, cross-context reactions
//!
//! Stored tokens expire after 30 days unless configured otherwise.

pub mod capability;
pub mod claims;
pub mod context;
pub mod credentials;
pub mod file_store;
pub mod session;

pub use capability::{evaluate, CapabilityHolder, RequiredCapability};
pub use claims::{Claims, ClaimsError};
pub use context::AuthContext;
pub use credentials::{Credential, KeyringTokenStore, MemoryTokenStore, TokenStore};
pub use file_store::FileTokenStore;
pub use session::Session;
