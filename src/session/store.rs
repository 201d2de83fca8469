//! Durable token storage.
//!
//! The session core reads and writes exactly two keys, `token` and
//! `refreshToken`. Where they live is the embedder's choice: the app plugs in
//! its platform key-value store, the CLI uses [`FileTokenStore`], tests use
//! [`MemoryTokenStore`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// Error returned by a [`TokenStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("token store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("token store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// The two persisted session keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKey {
    Access,
    Refresh,
}

impl TokenKey {
    /// Storage key name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Access => "token",
            Self::Refresh => "refreshToken",
        }
    }
}

/// A token pair as issued at sign-in or refresh.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// Key-value persistence for session tokens.
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync {
    /// Read one key.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the backing medium cannot be read.
    async fn get(&self, key: TokenKey) -> Result<Option<String>, StoreError>;

    /// Write one key.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the backing medium cannot be written.
    async fn set(&self, key: TokenKey, value: &str) -> Result<(), StoreError>;

    /// Remove both keys.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the backing medium cannot be written.
    async fn clear(&self) -> Result<(), StoreError>;
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// Process-local store; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    values: Mutex<BTreeMap<&'static str, String>>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a token pair.
    #[must_use]
    pub fn with_tokens(access: Option<&str>, refresh: Option<&str>) -> Self {
        let store = Self::new();
        {
            let mut values = store.lock();
            if let Some(access) = access {
                values.insert(TokenKey::Access.as_str(), access.to_owned());
            }
            if let Some(refresh) = refresh {
                values.insert(TokenKey::Refresh.as_str(), refresh.to_owned());
            }
        }
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<&'static str, String>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, key: TokenKey) -> Result<Option<String>, StoreError> {
        Ok(self.lock().get(key.as_str()).cloned())
    }

    async fn set(&self, key: TokenKey, value: &str) -> Result<(), StoreError> {
        self.lock().insert(key.as_str(), value.to_owned());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut values = self.lock();
        values.remove(TokenKey::Access.as_str());
        values.remove(TokenKey::Refresh.as_str());
        Ok(())
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

/// JSON object on disk, e.g. `{"token":"…","refreshToken":"…"}`.
///
/// Unknown keys written by other tools are preserved. A missing file reads as
/// an empty store.
#[derive(Debug)]
pub struct FileTokenStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileTokenStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(error) => Err(error.into()),
        }
    }

    /// Replace the file in one step so concurrent readers see either the old
    /// or the new contents, never a truncated file.
    async fn save(&self, values: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(values)?;
        let staging = self.staging_path();
        tokio::fs::write(&staging, bytes).await?;
        if let Err(error) = tokio::fs::rename(&staging, &self.path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(error.into());
        }
        Ok(())
    }

    /// Sibling of the store file, unique per write.
    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map_or_else(|| "tokens".into(), |name| name.to_string_lossy());
        self.path
            .with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
    }
}

#[async_trait::async_trait]
impl TokenStore for FileTokenStore {
    async fn get(&self, key: TokenKey) -> Result<Option<String>, StoreError> {
        let values = self.load().await?;
        Ok(values.get(key.as_str()).cloned())
    }

    async fn set(&self, key: TokenKey, value: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.load().await?;
        values.insert(key.as_str().to_owned(), value.to_owned());
        self.save(&values).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.load().await?;
        values.remove(TokenKey::Access.as_str());
        values.remove(TokenKey::Refresh.as_str());
        self.save(&values).await
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
