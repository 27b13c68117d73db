//! HTTP clients for the identity server and the protected API.
//!
//! `IdentityClient` speaks the unauthenticated half (sign-in, refresh) plus
//! the identity lookup. `ApiClient` sends arbitrary protected requests
//! through a [`RefreshCoordinator`] so token expiry is handled transparently.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::{Credential, Session};

use super::refresh::{RefreshCoordinator, RefreshExchange};
use super::ApiError;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

const SESSIONS_PATH: &str = "sessions";
const REFRESH_PATH: &str = "refresh";
const ME_PATH: &str = "me";

#[derive(Debug, Serialize)]
struct SignInRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenPairResponse {
    token: String,
    refresh_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    token: String,
    refresh_token: String,
    #[serde(default)]
    permissions: Vec<String>,
    #[serde(default)]
    roles: Vec<String>,
}

/// Result of a successful sign-in: the credential pair and the session it opens.
#[derive(Debug, Clone)]
pub struct SignIn {
    pub credential: Credential,
    pub session: Session,
}

/// Identity-server operations used by the auth context.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn sign_in(&self, email: &str, password: &str) -> Result<SignIn, ApiError>;

    /// Look up the subject behind `access_token`. Protected: may fail with
    /// `ExpiredCredential`.
    async fn me(&self, access_token: Option<String>) -> Result<Session, ApiError>;
}

/// Join a base URL and a relative path with exactly one slash.
fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn bearer_headers(token: Option<&str>) -> Result<header::HeaderMap, ApiError> {
    let mut headers = header::HeaderMap::new();
    if let Some(token) = token {
        let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ApiError::InvalidResponse(format!("Invalid bearer token: {}", e)))?;
        headers.insert(header::AUTHORIZATION, value);
    }
    Ok(headers)
}

/// Check if response is successful, returning an error with body if not.
async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body))
    }
}

async fn parse_json<T: DeserializeOwned>(response: reqwest::Response, url: &str) -> Result<T, ApiError> {
    response
        .json()
        .await
        .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", url, e)))
}

fn build_http_client() -> Result<Client, ApiError> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()?)
}

// ============================================================================
// Identity client
// ============================================================================

/// Client for the identity server.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct IdentityClient {
    client: Client,
    base_url: String,
}

impl IdentityClient {
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        Ok(Self::with_client(build_http_client()?, base_url))
    }

    /// Share an existing connection pool.
    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }

    pub fn http(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl IdentityService for IdentityClient {
    async fn sign_in(&self, email: &str, password: &str) -> Result<SignIn, ApiError> {
        let url = join_url(&self.base_url, SESSIONS_PATH);
        debug!(url = %url, email = email, "Signing in");

        let response = self
            .client
            .post(&url)
            .json(&SignInRequest { email, password })
            .send()
            .await?;
        let response = check_response(response).await?;
        let body: SignInResponse = parse_json(response, &url).await?;

        Ok(SignIn {
            credential: Credential::new(body.token, body.refresh_token),
            session: Session::new(email, body.permissions, body.roles),
        })
    }

    async fn me(&self, access_token: Option<String>) -> Result<Session, ApiError> {
        let url = join_url(&self.base_url, ME_PATH);
        let response = self
            .client
            .get(&url)
            .headers(bearer_headers(access_token.as_deref())?)
            .send()
            .await?;
        let response = check_response(response).await?;
        parse_json(response, &url).await
    }
}

#[async_trait]
impl RefreshExchange for IdentityClient {
    async fn refresh(&self, refresh_token: &str) -> Result<Credential, ApiError> {
        let url = join_url(&self.base_url, REFRESH_PATH);
        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;
        let response = check_response(response).await?;
        let pair: TokenPairResponse = parse_json(response, &url).await?;
        Ok(Credential::new(pair.token, pair.refresh_token))
    }
}

// ============================================================================
// Protected API client
// ============================================================================

/// Client for protected endpoints.
///
/// Every request goes through the coordinator: the current access token is
/// attached, and an expired-token rejection is replayed after the shared
/// refresh.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    coordinator: RefreshCoordinator,
}

impl ApiClient {
    pub fn new(client: Client, base_url: &str, coordinator: RefreshCoordinator) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
            coordinator,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = join_url(&self.base_url, path);
        let (this, url) = (self, url.as_str());
        self.coordinator
            .execute(move |token| this.send::<T, ()>(Method::GET, url, None, token))
            .await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let url = join_url(&self.base_url, path);
        let (this, url) = (self, url.as_str());
        self.coordinator
            .execute(move |token| this.send(Method::POST, url, Some(body), token))
            .await
    }

    /// One protected request with rate-limit backoff. No expiry handling here.
    async fn send<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
        token: Option<String>,
    ) -> Result<T, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .headers(bearer_headers(token.as_deref())?);
            if let Some(body) = body {
                request = request.json(body);
            }
            let response = request.send().await?;

            if response.status().as_u16() == 429 {
                // Rate limited
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(ApiError::RateLimited);
                }
                warn!(url = url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2; // Exponential backoff
                continue;
            }

            let response = check_response(response).await?;
            return parse_json(response, url).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://localhost:3333/", "me"), "http://localhost:3333/me");
        assert_eq!(join_url("http://localhost:3333", "/me"), "http://localhost:3333/me");
        assert_eq!(join_url("http://api/v1/", "/users/1"), "http://api/v1/users/1");
    }

    #[test]
    fn test_bearer_headers() {
        let headers = bearer_headers(Some("abc")).unwrap();
        assert_eq!(headers.get(header::AUTHORIZATION).unwrap(), "Bearer abc");
        assert!(bearer_headers(None).unwrap().is_empty());
        assert!(bearer_headers(Some("bad\ntoken")).is_err());
    }

    #[test]
    fn test_parse_sign_in_response() {
        let json = r#"{"token":"t1","refreshToken":"r1","permissions":["users.list"],"roles":["administrator"]}"#;
        let resp: SignInResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.token, "t1");
        assert_eq!(resp.refresh_token, "r1");
        assert_eq!(resp.permissions, vec!["users.list"]);
        assert_eq!(resp.roles, vec!["administrator"]);
    }

    #[test]
    fn test_refresh_request_wire_format() {
        let body = serde_json::to_string(&RefreshRequest { refresh_token: "r1" }).unwrap();
        assert_eq!(body, r#"{"refreshToken":"r1"}"#);

        let pair: TokenPairResponse =
            serde_json::from_str(r#"{"token":"t2","refreshToken":"r2"}"#).unwrap();
        assert_eq!(pair.token, "t2");
        assert_eq!(pair.refresh_token, "r2");
    }
}
