//! Bearer credential for the downstream chat API.
//!
//! The token is handed over by the OAuth flow (outside this crate) through
//! [`TokenStore::save`] and cached in memory. A 401 from the downstream API
//! revokes it. Absence means "unauthenticated" and is not an error.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::TokenError;

/// The current token plus when it was obtained.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(serialize_with = "serialize_secret")]
    pub access_token: Secret<String>,
    pub obtained_at: DateTime<Utc>,
}

impl std::fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"[REDACTED]")
            .field("obtained_at", &self.obtained_at)
            .finish()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

/// Token cache with optional file backing at `<data_dir>/token.json`.
#[derive(Debug)]
pub struct TokenStore {
    path: Option<PathBuf>,
    current: RwLock<Option<TokenRecord>>,
}

impl TokenStore {
    /// Memory-only store (tests, `run` without a data dir).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            current: RwLock::new(None),
        }
    }

    /// Open a file-backed store, loading any token already on disk.
    /// An unreadable or corrupt file is logged and treated as no token.
    pub async fn open(path: PathBuf) -> Self {
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(data) => match serde_json::from_str::<TokenRecord>(&data) {
                Ok(record) => {
                    debug!(path = %path.display(), "downstream token loaded");
                    Some(record)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "token file parse failed");
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "token file read failed");
                None
            }
        };
        Self {
            path: Some(path),
            current: RwLock::new(current),
        }
    }

    /// Current record, if any.
    pub async fn load(&self) -> Option<TokenRecord> {
        self.current.read().await.clone()
    }

    /// Exposed token value for an `Authorization` header.
    pub async fn bearer(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|r| r.access_token.expose_secret().clone())
    }

    pub async fn has_valid_token(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Replace the current token.
    pub async fn save(&self, token: &str) -> Result<TokenRecord, TokenError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(TokenError::Empty);
        }
        let record = TokenRecord {
            access_token: Secret::new(token.to_string()),
            obtained_at: Utc::now(),
        };
        let mut current = self.current.write().await;
        if let Some(path) = &self.path {
            write_token_file(path, &record).await?;
        }
        *current = Some(record.clone());
        info!("downstream token saved");
        Ok(record)
    }

    /// Drop the current token. Returns whether one was present.
    pub async fn revoke(&self) -> Result<bool, TokenError> {
        let mut current = self.current.write().await;
        let had = current.take().is_some();
        if let Some(path) = &self.path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(TokenError::Io {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }
        }
        if had {
            info!("downstream token revoked");
        }
        Ok(had)
    }
}

async fn write_token_file(path: &Path, record: &TokenRecord) -> Result<(), TokenError> {
    let io_err = |source| TokenError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let data = serde_json::to_vec_pretty(record)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &data).await.map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(io_err)?;
    }

    tokio::fs::rename(&tmp, path).await.map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_store_is_unauthenticated() {
        let store = TokenStore::in_memory();
        assert!(!store.has_valid_token().await);
        assert!(store.bearer().await.is_none());
        assert!(!store.revoke().await.unwrap());
    }

    #[tokio::test]
    async fn save_then_revoke() {
        let store = TokenStore::in_memory();
        store.save("pk_123").await.unwrap();
        assert_eq!(store.bearer().await.as_deref(), Some("pk_123"));
        assert!(store.revoke().await.unwrap());
        assert!(!store.has_valid_token().await);
    }

    #[tokio::test]
    async fn rejects_blank_token() {
        let store = TokenStore::in_memory();
        assert!(matches!(store.save("  ").await, Err(TokenError::Empty)));
    }

    #[tokio::test]
    async fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");

        let store = TokenStore::open(path.clone()).await;
        store.save("pk_abc").await.unwrap();
        drop(store);

        let reopened = TokenStore::open(path.clone()).await;
        assert_eq!(reopened.bearer().await.as_deref(), Some("pk_abc"));

        reopened.revoke().await.unwrap();
        assert!(!path.exists());
        let again = TokenStore::open(path).await;
        assert!(!again.has_valid_token().await);
    }

    #[tokio::test]
    async fn corrupt_file_means_no_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = TokenStore::open(path).await;
        assert!(!store.has_valid_token().await);
    }

    #[test]
    fn debug_redacts_token() {
        let record = TokenRecord {
            access_token: Secret::new("super-secret".into()),
            obtained_at: Utc::now(),
        };
        let out = format!("{record:?}");
        assert!(!out.contains("super-secret"));
        assert!(out.contains("[REDACTED]"));
    }
}
