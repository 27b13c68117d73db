use serde::Deserialize;
use thiserror::Error;

/// Body code the identity server attaches to a 401 when the access token expired.
pub const TOKEN_EXPIRED_CODE: &str = "token.expired";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access credential expired")]
    ExpiredCredential,

    #[error("Credential refresh denied: {0}")]
    RefreshDenied(String),

    #[error("Credential refresh timed out")]
    RefreshTimedOut,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Insufficient capability for this operation")]
    InsufficientCapability,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Credential storage failed: {0}")]
    Storage(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => Self::classify_unauthorized(body),
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Split a 401 into the expiry signal and every other rejection.
    fn classify_unauthorized(body: &str) -> Self {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(ErrorBody { code: Some(code), .. }) if code == TOKEN_EXPIRED_CODE => {
                ApiError::ExpiredCredential
            }
            Ok(ErrorBody { message: Some(message), .. }) => ApiError::Unauthorized(message),
            Ok(ErrorBody { code: Some(code), .. }) => ApiError::Unauthorized(code),
            _ => ApiError::Unauthorized(Self::truncate_body(body)),
        }
    }

    /// Whether this failure means the stored credential can no longer be used.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self,
            ApiError::ExpiredCredential | ApiError::RefreshDenied(_) | ApiError::Unauthorized(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_expired_code_is_classified_as_expired_credential() {
        let err = ApiError::from_status(
            StatusCode::UNAUTHORIZED,
            r#"{"error":true,"code":"token.expired","message":"Token expired."}"#,
        );
        assert!(matches!(err, ApiError::ExpiredCredential));
    }

    #[test]
    fn test_other_401_is_unauthorized() {
        let err = ApiError::from_status(
            StatusCode::UNAUTHORIZED,
            r#"{"error":true,"code":"token.invalid","message":"Invalid token."}"#,
        );
        match err {
            ApiError::Unauthorized(msg) => assert_eq!(msg, "Invalid token."),
            other => panic!("unexpected error: {other:?}"),
        }

        // Non-JSON body still maps to Unauthorized
        let err = ApiError::from_status(StatusCode::UNAUTHORIZED, "nope");
        assert!(matches!(err, ApiError::Unauthorized(_)));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(ApiError::from_status(StatusCode::FORBIDDEN, ""), ApiError::AccessDenied(_)));
        assert!(matches!(ApiError::from_status(StatusCode::NOT_FOUND, ""), ApiError::NotFound(_)));
        assert!(matches!(ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, ""), ApiError::RateLimited));
        assert!(matches!(ApiError::from_status(StatusCode::BAD_GATEWAY, ""), ApiError::ServerError(_)));
        assert!(matches!(ApiError::from_status(StatusCode::IM_A_TEAPOT, ""), ApiError::InvalidResponse(_)));
    }

    #[test]
    fn test_truncate_body() {
        let long = "x".repeat(MAX_ERROR_BODY_LENGTH + 10);
        let truncated = ApiError::truncate_body(&long);
        assert!(truncated.contains("truncated"));
        assert!(truncated.contains(&format!("{} total bytes", long.len())));
        assert_eq!(ApiError::truncate_body("short"), "short");
    }

    #[test]
    fn test_credential_failure_classes() {
        assert!(ApiError::ExpiredCredential.is_credential_failure());
        assert!(ApiError::RefreshDenied("x".into()).is_credential_failure());
        assert!(ApiError::Unauthorized("x".into()).is_credential_failure());
        assert!(!ApiError::RefreshTimedOut.is_credential_failure());
        assert!(!ApiError::NotFound("x".into()).is_credential_failure());
    }
}
