//! Local decoding of access-token claims.
//!
//! The payload segment is decoded without signature verification. The result
//! only drives UI-level gating; the server re-verifies the token on every
//! protected call.

use std::collections::HashSet;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

use super::capability::CapabilityHolder;

#[derive(Error, Debug)]
pub enum ClaimsError {
    #[error("Token is not a three-part JWT")]
    Malformed,

    #[error("Token payload is not valid base64url: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Token payload is not valid claims JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    /// Subject, the signed-in user's email
    pub sub: String,
    #[serde(default)]
    pub permissions: HashSet<String>,
    #[serde(default)]
    pub roles: HashSet<String>,
    pub exp: Option<i64>,
    pub iat: Option<i64>,
}

impl Claims {
    pub fn decode(token: &str) -> Result<Self, ClaimsError> {
        let mut parts = token.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ClaimsError::Malformed);
        };

        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl CapabilityHolder for Claims {
    fn permissions(&self) -> &HashSet<String> {
        &self.permissions
    }

    fn roles(&self) -> &HashSet<String> {
        &self.roles
    }
}

#[cfg(test)]
pub(crate) fn encode_test_token(payload: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.signature", header, body)
}
