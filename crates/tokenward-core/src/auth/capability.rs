//! Permission/role gating.
//!
//! Permissions are all-of, roles are any-of. An empty requirement always
//! grants access.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Anything that carries a permission set and a role set.
///
/// Implemented both by a materialized [`Session`](super::Session) and by raw
/// decoded [`Claims`](super::Claims), so the same rule gates views before and
/// after the identity lookup.
pub trait CapabilityHolder {
    fn permissions(&self) -> &HashSet<String>;
    fn roles(&self) -> &HashSet<String>;
}

/// Capabilities a protected operation asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredCapability {
    #[serde(default)]
    pub permissions: HashSet<String>,
    #[serde(default)]
    pub roles: HashSet<String>,
}

impl RequiredCapability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions.extend(permissions.into_iter().map(Into::into));
        self
    }

    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty() && self.roles.is_empty()
    }
}

/// Decide whether `holder` satisfies `required`.
pub fn evaluate<H>(holder: &H, required: &RequiredCapability) -> bool
where
    H: CapabilityHolder + ?Sized,
{
    let has_all_permissions = required
        .permissions
        .iter()
        .all(|p| holder.permissions().contains(p));

    let has_any_role = required.roles.is_empty()
        || required.roles.iter().any(|r| holder.roles().contains(r));

    has_all_permissions && has_any_role
}
