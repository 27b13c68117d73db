//! Client-side session layer for token-authenticated applications.
//!
//! - [`api::RefreshCoordinator`]: single-flight refresh of expired access
//!   tokens, with queued replay of every call that failed in the meantime
//! - [`auth::TokenStore`]: durable home of the access/refresh pair
//! - [`auth::evaluate`]: permission/role gating from decoded claims
//! - [`broadcast`]: sign-in/sign-out propagation between execution contexts
//! - [`guard::RouteGuard`]: gate for protected and guest-only views
//! - [`auth::AuthContext`]: sign-in, sign-out and session restore

pub mod api;
pub mod auth;
pub mod broadcast;
pub mod config;
pub mod guard;
pub mod routes;

pub use api::{ApiClient, ApiError, IdentityClient, RefreshCoordinator};
pub use auth::{AuthContext, Credential, RequiredCapability, Session, TokenStore};
pub use broadcast::{BroadcastHub, SessionBroadcast, SessionEvent};
pub use config::Config;
pub use guard::{GuardOutcome, RouteGuard};
pub use routes::{Navigator, Redirect, Routes};
