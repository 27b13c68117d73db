//! HTTP side of the session layer.
//!
//! - `IdentityClient`: sign-in, refresh exchange, identity lookup
//! - `ApiClient`: protected requests routed through the refresh coordinator
//! - `RefreshCoordinator`: single-flight credential refresh with a FIFO
//!   waiter queue
//!
//! Failures are classified into `ApiError`; only `ExpiredCredential` triggers
//! a refresh.

pub mod client;
pub mod error;
pub mod refresh;

pub use client::{ApiClient, IdentityClient, IdentityService, SignIn};
pub use error::ApiError;
pub use refresh::{PendingWaiter, RefreshCoordinator, RefreshExchange};
