// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Session/profile bootstrap controller.
//!
//! Single writer of [`BootstrapState`]. Screens read it through a
//! `tokio::sync::watch` receiver and branch on [`BootstrapState::phase`].
//!
//! Ordering rules:
//! - Initialization and the auth change listener start together. Every
//!   auth-driven identity change bumps `BootstrapState::version`;
//!   initialization captures the version before restoring the session and
//!   drops its result if the version moved in the meantime.
//! - Profile fetch results only land if the fetched user is still the
//!   current user.
//! - Operations apply their own result and the listener applies the matching
//!   event; whichever comes second is skipped (keyed by access token). A
//!   session cleared locally is never re-applied by a late event.
//! - After [`SessionController::shutdown`] no result reaches the state.

use crate::config::{default_channel_names, Config};
use crate::db::RecordStore;
use crate::error::{AuthError, Result};
use crate::models::{
    AppPhase, AuthChange, AuthEvent, BootstrapState, ChannelMembership, OnboardingFields, Profile,
    ProfileSeed, ProfileUpsert, Session, SignUpOutcome, UserInfo,
};
use crate::services::identity::IdentityProvider;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use validator::ValidateEmail;

/// Tunables for the controller.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Channels joined once onboarding completes
    pub default_channels: Vec<String>,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            default_channels: default_channel_names(),
        }
    }
}

impl From<&Config> for ControllerOptions {
    fn from(config: &Config) -> Self {
        Self {
            default_channels: config.default_channels.clone(),
        }
    }
}

/// How far a sign-out got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutOutcome {
    /// Local state cleared and the provider revoked the session
    Revoked,
    /// Local state cleared; the remote call failed
    LocalOnly,
}

/// Sign-up seed that could not be written yet.
#[derive(Debug, Clone)]
struct PendingSeed {
    email: Option<String>,
    seed: ProfileSeed,
}

struct Shared {
    identity: Arc<dyn IdentityProvider>,
    db: Arc<dyn RecordStore>,
    options: ControllerOptions,
    state: watch::Sender<BootstrapState>,
    torn_down: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
    tokens: Mutex<AppliedTokens>,
    pending_seeds: DashMap<String, PendingSeed>,
}

/// Owner of the app-wide authentication state.
///
/// Cheap to clone; all clones drive the same state. The controller is torn
/// down by [`shutdown`](Self::shutdown) or when the last clone is dropped.
#[derive(Clone)]
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    /// Subscribe to auth changes, then restore the persisted session.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        identity: Arc<dyn IdentityProvider>,
        db: Arc<dyn RecordStore>,
        options: ControllerOptions,
    ) -> Self {
        let (state, _) = watch::channel(BootstrapState::default());
        let subscription = identity.subscribe();

        let shared = Arc::new(Shared {
            identity,
            db,
            options,
            state,
            torn_down: AtomicBool::new(false),
            listener: Mutex::new(None),
            tokens: Mutex::new(AppliedTokens::default()),
            pending_seeds: DashMap::new(),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let listener = tokio::spawn(async move {
            let mut changes = Box::pin(subscription.into_stream());
            while let Some(change) = changes.next().await {
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                shared.on_auth_change(change);
            }
            tracing::debug!("Auth change listener stopped");
        });
        *shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);

        let version = shared.state.borrow().version;
        tokio::spawn(Shared::initialize(shared.clone(), version));

        Self { shared }
    }

    // ─── Readers ─────────────────────────────────────────────────

    /// Read-only handle on the state.
    pub fn subscribe(&self) -> watch::Receiver<BootstrapState> {
        self.shared.state.subscribe()
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> BootstrapState {
        self.shared.state.borrow().clone()
    }

    pub fn phase(&self) -> AppPhase {
        self.shared.state.borrow().phase()
    }

    pub fn is_logged_in(&self) -> bool {
        self.shared.state.borrow().is_logged_in()
    }

    pub fn user_info(&self) -> Option<UserInfo> {
        self.shared.state.borrow().user_info()
    }

    /// Wait until the state satisfies `predicate` and return that state.
    pub async fn wait_for(&self, predicate: impl FnMut(&BootstrapState) -> bool) -> BootstrapState {
        let mut rx = self.subscribe();
        let result = rx.wait_for(predicate).await.map(|s| (*s).clone());
        // The sender lives as long as `self`, so the channel cannot close here.
        result.unwrap_or_else(|_| self.state())
    }

    pub async fn wait_until_initialized(&self) -> BootstrapState {
        self.wait_for(|s| s.initialized).await
    }

    // ─── Operations ──────────────────────────────────────────────

    /// Sign in with email and password.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        let _busy = self.shared.busy();
        let email = email.trim();

        match self.shared.identity.sign_in_with_password(email, password).await {
            Ok(session) => {
                tracing::info!(user_id = %session.user.id, "Sign in successful");
                self.shared.apply_session(AuthEvent::SignedIn, &session);
                Ok(session)
            }
            Err(e) => {
                tracing::warn!(kind = e.kind(), error = %e, "Sign in failed");
                Err(e)
            }
        }
    }

    /// Create an identity, then seed its profile row.
    ///
    /// A failed seed never rolls back the identity: the seed is retried the
    /// next time a profile fetch for that user finds no row.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        seed: Option<ProfileSeed>,
    ) -> Result<SignUpOutcome> {
        let email = email.trim().to_string();
        if !email.validate_email() {
            return Err(AuthError::Validation("Please enter a valid email address".to_string()));
        }
        if password.is_empty() {
            return Err(AuthError::Validation("Please enter a password".to_string()));
        }

        let _busy = self.shared.busy();
        let seed = seed.filter(|s| !s.is_empty());

        let mut metadata = Map::new();
        if let Some(name) = seed.as_ref().and_then(|s| s.name.as_deref()) {
            metadata.insert("name".to_string(), Value::String(name.trim().to_string()));
        }

        let outcome = match self.shared.identity.sign_up(&email, password, metadata).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(kind = e.kind(), error = %e, "Sign up failed");
                return Err(e);
            }
        };
        tracing::info!(user_id = %outcome.user.id, "Sign up successful");

        if let Some(session) = &outcome.session {
            self.shared.apply_session(AuthEvent::SignedUp, session);
        }

        if let Some(seed) = seed {
            let pending = PendingSeed {
                email: outcome.user.email.clone(),
                seed,
            };
            if outcome.session.is_some() {
                self.shared.write_seed(&outcome.user.id, pending).await;
            } else {
                // No session to write with until the email is confirmed.
                self.shared
                    .pending_seeds
                    .insert(outcome.user.id.clone(), pending);
            }
        }

        Ok(outcome)
    }

    /// Clear local state, then ask the provider to revoke the session.
    pub async fn sign_out(&self) -> SignOutOutcome {
        let _busy = self.shared.busy();
        self.shared.apply_cleared();

        match self.shared.identity.sign_out().await {
            Ok(()) => {
                tracing::info!("Sign out successful");
                SignOutOutcome::Revoked
            }
            Err(e) => {
                tracing::warn!(kind = e.kind(), error = %e, "Remote sign out failed, local state cleared");
                SignOutOutcome::LocalOnly
            }
        }
    }

    /// Write the onboarding form to the current user's profile.
    pub async fn complete_onboarding(&self, fields: OnboardingFields) -> Result<Profile> {
        fields.check().map_err(AuthError::Validation)?;

        let user = self
            .shared
            .state
            .borrow()
            .user
            .clone()
            .ok_or(AuthError::NotAuthenticated)?;

        let _busy = self.shared.busy();
        let row = ProfileUpsert::from_onboarding(&user.id, user.email.as_deref(), &fields);

        let stored = match self.shared.db.upsert_profile(&row).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::error!(user_id = %user.id, error = %e, "Failed to complete profile setup");
                return Err(e);
            }
        };
        self.shared.pending_seeds.remove(&user.id);
        self.shared.apply_profile(&user.id, Some(stored.clone()));

        // Refetch so the cache reflects the row as the backend stores it.
        let profile = match self.shared.load_profile(&user.id).await {
            Ok(Some(profile)) => profile,
            _ => stored,
        };

        let still_current = self.shared.state.borrow().user_id() == Some(user.id.as_str());
        if still_current {
            self.shared.join_default_channels(&user.id).await;
        } else {
            tracing::debug!(user_id = %user.id, "Signed out during onboarding, not joining channels");
        }
        tracing::info!(user_id = %user.id, "Onboarding complete");
        Ok(profile)
    }

    /// Fetch and cache the profile for `user_id`.
    ///
    /// Returns `None` on error, leaving the cached profile untouched.
    pub async fn fetch_user_profile(&self, user_id: &str) -> Option<Profile> {
        let _busy = self.shared.busy();
        self.shared.load_profile(user_id).await.ok().flatten()
    }

    // ─── Teardown ────────────────────────────────────────────────

    /// Stop delivering results to state and release the auth subscription.
    ///
    /// Only the first call has any effect.
    pub async fn shutdown(&self) {
        if self.shared.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let listener = self
            .shared
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = listener {
            handle.abort();
            // Wait for the task to be dropped so the subscription is gone on return.
            let _ = handle.await;
        }
        tracing::debug!("Session controller shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.torn_down.load(Ordering::SeqCst)
    }
}

impl Shared {
    /// Apply `f` to the state unless torn down; notifies readers if it
    /// reports a change.
    fn update(&self, f: impl FnOnce(&mut BootstrapState) -> bool) -> bool {
        if self.torn_down.load(Ordering::SeqCst) {
            return false;
        }
        self.state.send_if_modified(|state| {
            let changed = f(state);
            if changed {
                state.settle();
            }
            changed
        })
    }

    /// Mark an operation in flight until the guard drops.
    fn busy(self: &Arc<Self>) -> BusyGuard {
        self.update(|s| {
            s.in_flight += 1;
            true
        });
        BusyGuard {
            shared: self.clone(),
        }
    }

    async fn initialize(self: Arc<Self>, version: u64) {
        let _init = InitGuard {
            shared: self.clone(),
        };

        let session = match self.identity.get_session().await {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::debug!("No persisted session");
                return;
            }
            Err(e) => {
                tracing::error!(kind = e.kind(), error = %e, "Error restoring session");
                return;
            }
        };

        let user = session.user.clone();
        let applied = self.update(|s| {
            if s.version != version {
                return false;
            }
            s.user = Some(user.clone());
            s.version += 1;
            true
        });
        if !applied {
            tracing::debug!(user_id = %user.id, "Restored session superseded by a newer auth change");
            return;
        }
        self.remember_token(&session.access_token);
        tracing::info!(user_id = %user.id, "Session restored");

        // The profile is part of the first settled state.
        let _ = self.load_profile(&user.id).await;
    }

    fn on_auth_change(self: &Arc<Self>, change: AuthChange) {
        tracing::debug!(event = ?change.event, "Applying auth change");
        match change.session {
            Some(session) if !change.event.clears_session() => {
                self.apply_session(change.event, &session);
            }
            _ => self.apply_cleared(),
        }
    }

    /// Set the user for an established session and start its profile fetch.
    fn apply_session(self: &Arc<Self>, event: AuthEvent, session: &Session) {
        let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
        if tokens.seen(&session.access_token) {
            // Already applied by the other path, or signed out since.
            return;
        }

        let user = session.user.clone();
        let mut fetch = false;
        let changed = self.update(|s| {
            let same_user = s.user_id() == Some(user.id.as_str());
            if !same_user {
                s.profile = None;
            }
            fetch = !(event == AuthEvent::TokenRefreshed && same_user && s.profile.is_some());
            if fetch {
                // Counted in the same update so readers never see a gap.
                s.in_flight += 1;
            }
            s.user = Some(user.clone());
            s.version += 1;
            true
        });
        if !changed {
            return;
        }
        tokens.current = Some(session.access_token.clone());
        drop(tokens);

        if fetch {
            let busy = BusyGuard {
                shared: self.clone(),
            };
            let shared = self.clone();
            tokio::spawn(async move {
                let _busy = busy;
                let _ = shared.load_profile(&user.id).await;
            });
        } else {
            tracing::debug!(user_id = %user.id, "Token refreshed, keeping cached profile");
        }
    }

    /// Clear user, profile and onboarding flag in one update.
    fn apply_cleared(&self) {
        {
            let mut tokens = self.tokens.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(token) = tokens.current.take() {
                tokens.retired = Some(token);
            }
        }
        self.update(|s| {
            s.clear_identity();
            true
        });
    }

    fn remember_token(&self, token: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current = Some(token.to_string());
    }

    /// Store `profile` if `user_id` is still the current user and the row is
    /// not older than the cached one.
    fn apply_profile(&self, user_id: &str, profile: Option<Profile>) -> bool {
        self.update(|s| {
            if s.user_id() != Some(user_id) {
                return false;
            }
            if let (Some(new), Some(cached)) = (&profile, &s.profile) {
                if let (Some(new_at), Some(cached_at)) = (new.updated_at, cached.updated_at) {
                    if new_at < cached_at {
                        return false;
                    }
                }
            }
            s.profile = profile;
            true
        })
    }

    /// Fetch the profile and cache it. Errors leave the cache untouched.
    async fn load_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let fetched = match self.db.fetch_profile(user_id).await {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Error fetching user profile");
                return Err(e);
            }
        };

        let profile = match fetched {
            Some(profile) => Some(profile),
            None => self.retry_pending_seed(user_id).await,
        };

        if !self.apply_profile(user_id, profile.clone()) {
            tracing::debug!(user_id = %user_id, "Discarding stale profile result");
        }
        Ok(profile)
    }

    /// Write a sign-up seed; park it for a later retry if the write fails.
    ///
    /// Seeds only ever create the row. An existing row, e.g. one written by
    /// onboarding, is left as it is.
    async fn write_seed(&self, user_id: &str, pending: PendingSeed) {
        let row = ProfileUpsert::from_seed(user_id, pending.email.as_deref(), &pending.seed);
        match self.db.insert_profile_if_absent(&row).await {
            Ok(None) => {
                self.pending_seeds.remove(user_id);
                tracing::debug!(user_id = %user_id, "Profile row already exists, seed skipped");
            }
            Ok(Some(profile)) => {
                self.pending_seeds.remove(user_id);
                // A concurrent fetch may have found no row yet.
                self.update(|s| {
                    if s.user_id() != Some(user_id) || s.profile.is_some() {
                        return false;
                    }
                    s.profile = Some(profile);
                    true
                });
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Profile seed failed, will retry on next profile fetch");
                self.pending_seeds.insert(user_id.to_string(), pending);
            }
        }
    }

    async fn retry_pending_seed(&self, user_id: &str) -> Option<Profile> {
        let (_, pending) = self.pending_seeds.remove(user_id)?;
        let row = ProfileUpsert::from_seed(user_id, pending.email.as_deref(), &pending.seed);
        match self.db.insert_profile_if_absent(&row).await {
            Ok(Some(profile)) => {
                tracing::info!(user_id = %user_id, "Parked profile seed written");
                Some(profile)
            }
            Ok(None) => {
                // The row appeared since the fetch; read it back as stored.
                self.db.fetch_profile(user_id).await.ok().flatten()
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Profile seed retry failed");
                self.pending_seeds.insert(user_id.to_string(), pending);
                None
            }
        }
    }

    /// Best effort: add the user to default channels they are not in yet.
    async fn join_default_channels(&self, user_id: &str) -> usize {
        let names = &self.options.default_channels;
        if names.is_empty() {
            return 0;
        }

        let joined = async {
            let channels = self.db.find_channels(names).await?;
            let existing = self.db.channel_memberships(user_id).await?;
            let now = Utc::now();
            let rows: Vec<ChannelMembership> = channels
                .into_iter()
                .filter(|c| !existing.iter().any(|m| m.channel_id == c.id))
                .map(|c| ChannelMembership {
                    user_id: user_id.to_string(),
                    channel_id: c.id,
                    joined_at: Some(now),
                })
                .collect();
            self.db.add_memberships(&rows).await?;
            Ok::<usize, AuthError>(rows.len())
        }
        .await;

        match joined {
            Ok(0) => {
                tracing::debug!(user_id = %user_id, "Already in all default channels");
                0
            }
            Ok(n) => {
                tracing::info!(user_id = %user_id, count = n, "Joined default channels");
                n
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to join default channels");
                0
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let slot = self.listener.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }
}

/// Access tokens the controller has already acted on.
///
/// Events queued behind a direct apply, or behind a local sign-out, carry
/// one of these and are skipped.
#[derive(Default)]
struct AppliedTokens {
    current: Option<String>,
    retired: Option<String>,
}

impl AppliedTokens {
    fn seen(&self, token: &str) -> bool {
        self.current.as_deref() == Some(token) || self.retired.as_deref() == Some(token)
    }
}

/// Decrements the in-flight counter on every exit path.
struct BusyGuard {
    shared: Arc<Shared>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.shared.update(|s| {
            s.in_flight = s.in_flight.saturating_sub(1);
            true
        });
    }
}

/// Marks the controller initialized when initialization ends, however it ends.
struct InitGuard {
    shared: Arc<Shared>,
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        self.shared.update(|s| {
            if s.initialized {
                return false;
            }
            s.initialized = true;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryDb;
    use crate::services::MemoryIdentity;
    use std::time::Duration;

    fn controller(identity: &MemoryIdentity, db: &MemoryDb) -> SessionController {
        SessionController::start(
            Arc::new(identity.clone()),
            Arc::new(db.clone()),
            ControllerOptions::default(),
        )
    }

    #[tokio::test]
    async fn busy_guard_balances_in_flight() {
        let controller = controller(&MemoryIdentity::new(), &MemoryDb::new());
        controller.wait_until_initialized().await;

        let guard = controller.shared.busy();
        assert!(controller.state().loading);
        drop(guard);

        let state = controller.state();
        assert_eq!(state.in_flight, 0);
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn session_applied_once_by_operation_and_event() {
        let identity = MemoryIdentity::new().with_account("u1", "a@b.com", "pw");
        let db = MemoryDb::new();
        let controller = controller(&identity, &db);
        controller.wait_until_initialized().await;

        controller.sign_in("a@b.com", "pw").await.unwrap();
        controller
            .wait_for(|s| s.user.is_some() && !s.loading)
            .await;
        // Give the listener a chance to see the SignedIn event.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(db.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn writes_stop_after_shutdown() {
        let identity = MemoryIdentity::new();
        let controller = controller(&identity, &MemoryDb::new());
        controller.wait_until_initialized().await;
        controller.shutdown().await;

        let before = controller.state();
        controller.shared.apply_cleared();
        assert_eq!(controller.state(), before);
        assert!(controller.is_shut_down());
    }

    #[tokio::test]
    async fn poisoned_token_lock_still_applies_events() {
        let identity = MemoryIdentity::new();
        let controller = controller(&identity, &MemoryDb::new());
        controller.wait_until_initialized().await;

        let shared = controller.shared.clone();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _tokens = shared.tokens.lock().unwrap();
            panic!("poisoned while holding the token lock");
        }));
        assert!(controller.shared.tokens.is_poisoned());

        let session =
            MemoryIdentity::session_for(MemoryIdentity::user("u1", "u1@dorm.edu", Map::new()));
        identity.emit(AuthChange::established(AuthEvent::SignedIn, session));
        let state = tokio::time::timeout(
            Duration::from_secs(2),
            controller.wait_for(|s| s.user.is_some()),
        )
        .await
        .unwrap();
        assert_eq!(state.user_id(), Some("u1"));

        controller.sign_out().await;
        assert!(controller.state().user.is_none());
    }

    #[test]
    fn options_follow_config() {
        let mut config = Config::test_default();
        config.default_channels = vec!["Floor 2".to_string()];
        assert_eq!(
            ControllerOptions::from(&config).default_channels,
            vec!["Floor 2"]
        );
    }
}
