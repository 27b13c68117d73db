//! Well-known destinations and the navigation collaborator.

use serde::{Deserialize, Serialize};

/// The three places the session layer ever sends a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Routes {
    /// Unauthenticated entry point (sign-in view)
    pub entry: String,
    /// Default page for an authenticated user
    pub landing: String,
    /// Generic error page
    pub error: String,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            entry: "/".to_string(),
            landing: "/dashboard".to_string(),
            error: "/error".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub destination: String,
    pub permanent: bool,
}

impl Redirect {
    /// Non-permanent redirect; session redirects are never cacheable.
    pub fn to(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            permanent: false,
        }
    }
}

/// Route-rendering side of an execution context.
pub trait Navigator: Send + Sync {
    fn navigate(&self, path: &str);

    /// Discard all in-memory view state and rebuild it from scratch.
    fn reload(&self);
}
