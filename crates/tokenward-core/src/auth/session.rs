use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::capability::CapabilityHolder;
use super::claims::Claims;

/// The signed-in user as seen by this execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "email")]
    pub subject_email: String,
    #[serde(default)]
    pub permissions: HashSet<String>,
    #[serde(default)]
    pub roles: HashSet<String>,
}

impl Session {
    pub fn new<P, R>(subject_email: impl Into<String>, permissions: P, roles: R) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        R: IntoIterator,
        R::Item: Into<String>,
    {
        Self {
            subject_email: subject_email.into(),
            permissions: permissions.into_iter().map(Into::into).collect(),
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<Claims> for Session {
    fn from(claims: Claims) -> Self {
        Self {
            subject_email: claims.sub,
            permissions: claims.permissions,
            roles: claims.roles,
        }
    }
}

impl CapabilityHolder for Session {
    fn permissions(&self) -> &HashSet<String> {
        &self.permissions
    }

    fn roles(&self) -> &HashSet<String> {
        &self.roles
    }
}
