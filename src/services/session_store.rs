// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Local persistence of the current session between app launches.

use crate::error::{AuthError, Result};
use crate::models::Session;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Where the identity provider keeps the session across restarts.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    async fn load(&self) -> Result<Option<Session>>;
    async fn save(&self, session: &Session) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// JSON file on local disk.
#[derive(Debug, Clone)]
pub struct FileSessionStorage {
    path: PathBuf,
}

impl FileSessionStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SessionStorage for FileSessionStorage {
    async fn load(&self) -> Result<Option<Session>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AuthError::Storage(e.to_string())),
        };

        match serde_json::from_slice::<Session>(&bytes) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                // A corrupt file must not wedge startup; treat it as signed out.
                tracing::warn!(path = %self.path.display(), error = %e, "Discarding unreadable session file");
                self.clear().await?;
                Ok(None)
            }
        }
    }

    async fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AuthError::Storage(e.to_string()))?;
        }
        let json = serde_json::to_vec(session).map_err(|e| AuthError::Storage(e.to_string()))?;

        // Write-then-rename so a crash never leaves a truncated file behind.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AuthError::Storage(e.to_string()))
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AuthError::Storage(e.to_string())),
        }
    }
}

/// Process-local storage, for tests and ephemeral runs.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStorage {
    slot: Arc<RwLock<Option<Session>>>,
}

impl MemorySessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Some(session))),
        }
    }
}

#[async_trait]
impl SessionStorage for MemorySessionStorage {
    async fn load(&self) -> Result<Option<Session>> {
        Ok(self.slot.read().await.clone())
    }

    async fn save(&self, session: &Session) -> Result<()> {
        *self.slot.write().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.slot.write().await = None;
        Ok(())
    }
}

/// The live session shared between the identity provider and the
/// record-storage adapter (which needs the bearer token).
#[derive(Debug, Clone, Default)]
pub struct SessionCell {
    inner: Arc<RwLock<Option<Session>>>,
}

impl SessionCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self) -> Option<Session> {
        self.inner.read().await.clone()
    }

    pub async fn set(&self, session: Option<Session>) {
        *self.inner.write().await = session;
    }

    pub async fn access_token(&self) -> Option<String> {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|s| s.access_token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuthenticatedUser;
    use chrono::{Duration, Utc};

    fn session() -> Session {
        Session {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            token_type: "bearer".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            user: AuthenticatedUser {
                id: "u1".to_string(),
                email: Some("sam@dorm.edu".to_string()),
                user_metadata: Default::default(),
                app_metadata: Default::default(),
                created_at: None,
            },
        }
    }

    #[tokio::test]
    async fn file_storage_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileSessionStorage::new(dir.path().join("nested/session.json"));

        assert!(storage.load().await.unwrap().is_none());
        storage.save(&session()).await.unwrap();
        let loaded = storage.load().await.unwrap().expect("session persisted");
        assert_eq!(loaded.user.id, "u1");

        storage.clear().await.unwrap();
        assert!(storage.load().await.unwrap().is_none());
        // clearing twice is fine
        storage.clear().await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_reads_as_signed_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let storage = FileSessionStorage::new(&path);
        assert!(storage.load().await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn session_cell_exposes_token() {
        let cell = SessionCell::new();
        assert_eq!(cell.access_token().await, None);
        cell.set(Some(session())).await;
        assert_eq!(cell.access_token().await.as_deref(), Some("access"));
    }
}
