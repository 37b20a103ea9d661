//! Access-token storage and JWT expiry checks.
//!
//! DESIGN
//! ======
//! The realtime channel authenticates with the same bearer JWT as the REST
//! API, read from a local store under a fixed key. Expiry is judged locally
//! from the `exp` claim; the signature is never verified client-side.
//!
//! ERROR HANDLING
//! ==============
//! [`resolve_token`] folds every failure (unreadable store, malformed or
//! expired token) into `None`, so callers simply skip connecting.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tracing::{debug, warn};

/// Key under which the access token is stored.
pub const TOKEN_STORAGE_KEY: &str = "accessToken";

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("token store is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("malformed token: {0}")]
    Malformed(&'static str),
}

// =============================================================================
// STORES
// =============================================================================

/// Secure local storage for the access token.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self) -> Result<Option<String>, TokenError>;
    async fn store(&self, token: &str) -> Result<(), TokenError>;
    async fn clear(&self) -> Result<(), TokenError>;
}

/// Process-local store, used when the token is handed in directly.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<String>>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self { token: Mutex::new(token) }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.token.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn load(&self) -> Result<Option<String>, TokenError> {
        Ok(self.slot().clone())
    }

    async fn store(&self, token: &str) -> Result<(), TokenError> {
        *self.slot() = Some(token.to_owned());
        Ok(())
    }

    async fn clear(&self) -> Result<(), TokenError> {
        *self.slot() = None;
        Ok(())
    }
}

/// JSON key/value file readable only by the owning user.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn read_entries(&self) -> Result<BTreeMap<String, String>, TokenError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_entries(&self, entries: &BTreeMap<String, String>) -> Result<(), TokenError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(entries)?).await?;
        restrict_permissions(&self.path).await
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &std::path::Path) -> Result<(), TokenError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &std::path::Path) -> Result<(), TokenError> {
    Ok(())
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self) -> Result<Option<String>, TokenError> {
        let mut entries = self.read_entries().await?;
        Ok(entries.remove(TOKEN_STORAGE_KEY).filter(|t| !t.is_empty()))
    }

    async fn store(&self, token: &str) -> Result<(), TokenError> {
        let mut entries = self.read_entries().await?;
        entries.insert(TOKEN_STORAGE_KEY.to_owned(), token.to_owned());
        self.write_entries(&entries).await
    }

    async fn clear(&self) -> Result<(), TokenError> {
        let mut entries = self.read_entries().await?;
        if entries.remove(TOKEN_STORAGE_KEY).is_some() {
            self.write_entries(&entries).await?;
        }
        Ok(())
    }
}

// =============================================================================
// JWT EXPIRY
// =============================================================================

/// Read the `exp` claim (seconds since epoch). `Ok(None)` when absent.
///
/// # Errors
///
/// Returns [`TokenError::Malformed`] when the token is not three dot-separated
/// segments or its claims segment is not base64url-encoded JSON.
#[allow(clippy::cast_possible_truncation)]
pub fn decode_expiry(token: &str) -> Result<Option<i64>, TokenError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(claims), Some(_sig), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::Malformed("expected three segments"));
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(claims.trim_end_matches('='))
        .map_err(|_| TokenError::Malformed("claims segment is not base64url"))?;
    let claims: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed("claims segment is not JSON"))?;
    Ok(claims.get("exp").and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))))
}

/// Whether the token is unusable at `now_secs`. Malformed tokens count as expired.
#[must_use]
pub fn is_expired(token: &str, now_secs: i64) -> bool {
    match decode_expiry(token) {
        Ok(Some(exp)) => exp <= now_secs,
        Ok(None) => false,
        Err(_) => true,
    }
}

#[must_use]
pub fn now_secs() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// Load a usable token, or `None` if missing, unreadable, or expired.
pub async fn resolve_token(store: &dyn TokenStore) -> Option<String> {
    let token = match store.load().await {
        Ok(Some(token)) => token,
        Ok(None) => {
            debug!("no access token stored");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "token store unreadable");
            return None;
        }
    };
    if is_expired(&token, now_secs()) {
        debug!("stored access token expired or malformed");
        return None;
    }
    Some(token)
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
