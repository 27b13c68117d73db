use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::credentials::{max_age_from_days, Credential, StoredValue, TokenStore};

/// Credentials file name in cache directory
const CREDENTIALS_FILE: &str = "credentials.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialsFile {
    access_token: Option<StoredValue>,
    refresh_token: Option<StoredValue>,
}

/// Token store persisted as a JSON file, for hosts without a usable keychain.
pub struct FileTokenStore {
    cache_dir: PathBuf,
    max_age: Duration,
}

impl FileTokenStore {
    pub fn new(cache_dir: PathBuf, max_age_days: i64) -> Result<Self> {
        Ok(Self {
            cache_dir,
            max_age: max_age_from_days(max_age_days)?,
        })
    }

    fn credentials_path(&self) -> PathBuf {
        self.cache_dir.join(CREDENTIALS_FILE)
    }

    fn read_file(&self) -> Result<Option<CredentialsFile>> {
        let path = self.credentials_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .context("Failed to read credentials file")?;
        let file = serde_json::from_str(&contents)
            .context("Failed to parse credentials file")?;
        Ok(Some(file))
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Result<Option<Credential>> {
        let Some(file) = self.read_file()? else {
            return Ok(None);
        };
        let access = file.access_token.and_then(StoredValue::live);
        let refresh = file.refresh_token.and_then(StoredValue::live);
        if access.is_none() || refresh.is_none() {
            debug!(path = ?self.credentials_path(), "Stored credential incomplete or expired");
        }
        Ok(access.zip(refresh).map(|(a, r)| Credential::new(a, r)))
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let path = self.credentials_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = CredentialsFile {
            access_token: Some(StoredValue::new(&credential.access_token, self.max_age)?),
            refresh_token: Some(StoredValue::new(&credential.refresh_token, self.max_age)?),
        };
        let contents = serde_json::to_string_pretty(&file)?;
        std::fs::write(&path, contents).context("Failed to write credentials file")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let path = self.credentials_path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove credentials file")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_file_store_save_load_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().join("nested"), 30).unwrap();

        assert!(store.load().unwrap().is_none());

        let cred = Credential::new("access", "refresh");
        store.save(&cred).unwrap();
        assert_eq!(store.load().unwrap(), Some(cred));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn test_file_store_expired_value_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().to_path_buf(), 30).unwrap();
        store.save(&Credential::new("access", "refresh")).unwrap();

        let mut file = store.read_file().unwrap().unwrap();
        if let Some(ref mut refresh) = file.refresh_token {
            refresh.expires_at = Utc::now() - Duration::minutes(1);
        }
        std::fs::write(store.credentials_path(), serde_json::to_string(&file).unwrap()).unwrap();

        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_file_store_rejects_out_of_range_max_age() {
        let dir = tempfile::tempdir().unwrap();
        for days in [0, -30, 100_000_000, i64::MAX] {
            assert!(FileTokenStore::new(dir.path().to_path_buf(), days).is_err());
        }
        assert!(!dir.path().join(CREDENTIALS_FILE).exists());
    }

    #[test]
    fn test_file_store_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileTokenStore::new(dir.path().to_path_buf(), 30).unwrap();
        std::fs::write(store.credentials_path(), "not json").unwrap();
        assert!(store.load().is_err());
    }
}
