use std::fmt;

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Duration, Utc};
use keyring::Entry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Keychain service name for stored tokens
const SERVICE_NAME: &str = "tokenward";

/// Keychain account holding the access token
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Keychain account holding the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Default lifetime of a persisted token value.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 30;

/// Upper bound accepted for a configured token lifetime.
pub const MAX_AGE_LIMIT_DAYS: i64 = 3650;

/// Validate a configured token lifetime in days.
pub fn max_age_from_days(days: i64) -> Result<Duration> {
    ensure!(
        (1..=MAX_AGE_LIMIT_DAYS).contains(&days),
        "credential max age must be between 1 and {} days, got {}",
        MAX_AGE_LIMIT_DAYS,
        days
    );
    Duration::try_days(days).with_context(|| format!("credential max age out of range: {} days", days))
}

/// An access/refresh token pair. Replaced wholesale, never patched.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Durable home of the current credential.
///
/// The only component allowed to touch persistent storage. Implementations do
/// no retries and no network access; `clear` on an empty store succeeds.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<Credential>>;
    fn save(&self, credential: &Credential) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// A single persisted token with its own expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

impl StoredValue {
    pub fn new(value: &str, max_age: Duration) -> Result<Self> {
        let expires_at = Utc::now()
            .checked_add_signed(max_age)
            .context("Token expiry out of range")?;
        Ok(Self {
            value: value.to_string(),
            expires_at,
        })
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// The value if it has not expired yet
    pub fn live(self) -> Option<String> {
        if self.is_expired() {
            None
        } else {
            Some(self.value)
        }
    }
}

/// Token store backed by the OS keychain.
///
/// Access and refresh tokens are two independent entries, each stamped with
/// its own expiry.
pub struct KeyringTokenStore {
    service: String,
    max_age: Duration,
}

impl KeyringTokenStore {
    pub fn new(max_age_days: i64) -> Result<Self> {
        Self::with_service(SERVICE_NAME, max_age_days)
    }

    pub fn with_service(service: &str, max_age_days: i64) -> Result<Self> {
        Ok(Self {
            service: service.to_string(),
            max_age: max_age_from_days(max_age_days)?,
        })
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(raw) => {
                let stored: StoredValue = serde_json::from_str(&raw)
                    .with_context(|| format!("Failed to parse keychain value: {}", key))?;
                Ok(stored.live())
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {} from keychain", key)),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let stored = serde_json::to_string(&StoredValue::new(value, self.max_age)?)?;
        self.entry(key)?
            .set_password(&stored)
            .with_context(|| format!("Failed to store {} in keychain", key))
    }

    fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {} from keychain", key)),
        }
    }
}

impl TokenStore for KeyringTokenStore {
    fn load(&self) -> Result<Option<Credential>> {
        let access = self.read(ACCESS_TOKEN_KEY)?;
        let refresh = self.read(REFRESH_TOKEN_KEY)?;
        Ok(access.zip(refresh).map(|(a, r)| Credential::new(a, r)))
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        self.write(ACCESS_TOKEN_KEY, &credential.access_token)?;
        self.write(REFRESH_TOKEN_KEY, &credential.refresh_token)
    }

    fn clear(&self) -> Result<()> {
        self.delete(ACCESS_TOKEN_KEY)?;
        self.delete(REFRESH_TOKEN_KEY)
    }
}

/// Process-local store for server-side request contexts and tests.
#[derive(Default)]
pub struct MemoryTokenStore {
    credential: Mutex<Option<Credential>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            credential: Mutex::new(Some(credential)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<Credential>> {
        Ok(self.credential.lock().clone())
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        *self.credential.lock() = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.credential.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_debug_redacts_tokens() {
        let cred = Credential::new("secret-access", "secret-refresh");
        let debug = format!("{:?}", cred);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn test_stored_value_expiry() {
        let fresh = StoredValue::new("abc", Duration::days(1)).unwrap();
        assert!(!fresh.is_expired());
        assert_eq!(fresh.live().as_deref(), Some("abc"));

        let mut old = StoredValue::new("abc", Duration::days(1)).unwrap();
        old.expires_at = Utc::now() - Duration::minutes(1);
        assert!(old.is_expired());
        assert_eq!(old.live(), None);
    }

    #[test]
    fn test_max_age_validation() {
        assert_eq!(max_age_from_days(30).unwrap(), Duration::days(30));
        assert_eq!(max_age_from_days(MAX_AGE_LIMIT_DAYS).unwrap(), Duration::days(3650));
        for days in [0, -1, MAX_AGE_LIMIT_DAYS + 1, 100_000_000, i64::MAX, i64::MIN] {
            assert!(max_age_from_days(days).is_err(), "accepted {} days", days);
        }
        assert!(KeyringTokenStore::new(0).is_err());
        assert!(KeyringTokenStore::new(i64::MAX).is_err());
    }

    #[test]
    fn test_stored_value_expiry_overflow_is_an_error() {
        assert!(StoredValue::new("abc", Duration::days(100_000_000)).is_err());
    }

    #[test]
    fn test_memory_store_roundtrip_and_clear() {
        let store = MemoryTokenStore::new();
        assert!(store.load().unwrap().is_none());

        let cred = Credential::new("a1", "r1");
        store.save(&cred).unwrap();
        assert_eq!(store.load().unwrap(), Some(cred));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());

        // Clearing an empty store is not an error
        store.clear().unwrap();
    }
}
