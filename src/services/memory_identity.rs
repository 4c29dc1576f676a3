// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-process identity provider for tests and offline runs.

use crate::error::{AuthError, Result};
use crate::models::{AuthChange, AuthEvent, AuthenticatedUser, Session, SignUpOutcome};
use crate::services::identity::{AuthBroadcaster, AuthSubscription, IdentityProvider};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Behaviour of `get_session`, for exercising the restore path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreMode {
    #[default]
    Normal,
    /// Return a connectivity error
    Fail,
    /// Panic inside the provider call
    Panic,
}

struct Account {
    password: String,
    user: AuthenticatedUser,
}

#[derive(Default)]
struct Inner {
    accounts: DashMap<String, Account>,
    persisted: RwLock<Option<Session>>,
    events: AuthBroadcaster,
    restore_mode: RwLock<RestoreMode>,
    restore_delay_ms: AtomicU64,
    offline: AtomicBool,
    confirm_email: AtomicBool,
    next_id: AtomicUsize,
    sign_out_calls: AtomicUsize,
}

/// Identity provider held in process memory.
#[derive(Clone, Default)]
pub struct MemoryIdentity {
    inner: Arc<Inner>,
}

impl MemoryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account that can sign in with `password`.
    pub fn with_account(self, id: &str, email: &str, password: &str) -> Self {
        self.inner.accounts.insert(
            email.to_lowercase(),
            Account {
                password: password.to_string(),
                user: Self::user(id, email, Map::new()),
            },
        );
        self
    }

    /// Pretend a session for `user_id` was persisted by a previous launch.
    pub async fn restore(&self, user_id: &str, email: &str) -> Session {
        let session = Self::session_for(Self::user(user_id, email, Map::new()));
        *self.inner.persisted.write().await = Some(session.clone());
        session
    }

    pub async fn set_restore_mode(&self, mode: RestoreMode) {
        *self.inner.restore_mode.write().await = mode;
    }

    /// Delay `get_session` by `delay`.
    pub fn set_restore_delay(&self, delay: std::time::Duration) {
        self.inner
            .restore_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every remote call fails with a connectivity error.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// Sign-up returns no session until the email is confirmed.
    pub fn set_confirm_email(&self, confirm: bool) {
        self.inner.confirm_email.store(confirm, Ordering::SeqCst);
    }

    /// Push an arbitrary change onto the stream, as the hosted service would.
    pub fn emit(&self, change: AuthChange) {
        self.inner.events.emit(change);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.events.subscriber_count()
    }

    pub fn sign_out_calls(&self) -> usize {
        self.inner.sign_out_calls.load(Ordering::SeqCst)
    }

    pub async fn persisted(&self) -> Option<Session> {
        self.inner.persisted.read().await.clone()
    }

    pub fn user(id: &str, email: &str, user_metadata: Map<String, Value>) -> AuthenticatedUser {
        AuthenticatedUser {
            id: id.to_string(),
            email: Some(email.to_string()),
            user_metadata,
            app_metadata: Map::new(),
            created_at: Some(Utc::now()),
        }
    }

    /// A fresh one-hour session for `user`.
    pub fn session_for(user: AuthenticatedUser) -> Session {
        let nonce = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Session {
            access_token: format!("access-{}-{}", user.id, nonce),
            refresh_token: format!("refresh-{}-{}", user.id, nonce),
            token_type: "bearer".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            user,
        }
    }

    fn check_online(&self) -> Result<()> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(AuthError::Connectivity(
                "Network request failed (offline)".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentity {
    async fn get_session(&self) -> Result<Option<Session>> {
        let delay = self.inner.restore_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        let mode = *self.inner.restore_mode.read().await;
        match mode {
            RestoreMode::Normal => Ok(self.inner.persisted.read().await.clone()),
            RestoreMode::Fail => Err(AuthError::Connectivity(
                "session restore failed (injected)".to_string(),
            )),
            RestoreMode::Panic => panic!("session restore panicked (injected)"),
        }
    }

    fn subscribe(&self) -> AuthSubscription {
        self.inner.events.subscribe()
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        self.check_online()?;
        let user = match self.inner.accounts.get(&email.to_lowercase()) {
            Some(account) if account.password == password => account.user.clone(),
            _ => return Err(AuthError::Credential("Invalid login credentials".to_string())),
        };

        let session = Self::session_for(user);
        *self.inner.persisted.write().await = Some(session.clone());
        self.inner
            .events
            .emit(AuthChange::established(AuthEvent::SignedIn, session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Map<String, Value>,
    ) -> Result<SignUpOutcome> {
        self.check_online()?;
        let key = email.to_lowercase();
        if self.inner.accounts.contains_key(&key) {
            return Err(AuthError::Credential("User already registered".to_string()));
        }

        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let user = Self::user(&format!("user-{}", n), email, metadata);
        self.inner.accounts.insert(
            key,
            Account {
                password: password.to_string(),
                user: user.clone(),
            },
        );

        if self.inner.confirm_email.load(Ordering::SeqCst) {
            return Ok(SignUpOutcome {
                user,
                session: None,
            });
        }

        let session = Self::session_for(user.clone());
        *self.inner.persisted.write().await = Some(session.clone());
        self.inner
            .events
            .emit(AuthChange::established(AuthEvent::SignedUp, session.clone()));
        Ok(SignUpOutcome {
            user,
            session: Some(session),
        })
    }

    async fn sign_out(&self) -> Result<()> {
        self.inner.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        *self.inner.persisted.write().await = None;
        self.inner.events.emit(AuthChange::cleared(AuthEvent::SignedOut));
        self.check_online()
    }

    async fn refresh_session(&self) -> Result<Option<Session>> {
        self.check_online()?;
        let mut persisted = self.inner.persisted.write().await;
        let Some(current) = persisted.as_ref() else {
            return Ok(None);
        };
        let session = Self::session_for(current.user.clone());
        *persisted = Some(session.clone());
        drop(persisted);

        self.inner
            .events
            .emit(AuthChange::established(AuthEvent::TokenRefreshed, session.clone()));
        Ok(Some(session))
    }
}
