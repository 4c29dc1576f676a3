// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Session controller behaviour over in-memory adapters.

mod common;

use async_trait::async_trait;
use common::*;
use dormx_session::db::{MemoryDb, RecordStore};
use dormx_session::models::{
    AuthChange, AuthEvent, Channel, ChannelMembership, OnboardingFields, Profile, ProfileSeed,
    ProfileUpsert,
};
use dormx_session::services::{MemoryIdentity, RestoreMode};
use dormx_session::{AppPhase, AuthError, ControllerOptions, SessionController, SignOutOutcome};
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;

/// Record store whose successful seed inserts are answered late.
#[derive(Clone)]
struct SlowSeedDb {
    inner: MemoryDb,
    delay: Duration,
}

#[async_trait]
impl RecordStore for SlowSeedDb {
    async fn fetch_profile(&self, user_id: &str) -> dormx_session::Result<Option<Profile>> {
        self.inner.fetch_profile(user_id).await
    }

    async fn upsert_profile(&self, row: &ProfileUpsert) -> dormx_session::Result<Profile> {
        self.inner.upsert_profile(row).await
    }

    async fn insert_profile_if_absent(
        &self,
        row: &ProfileUpsert,
    ) -> dormx_session::Result<Option<Profile>> {
        let inserted = self.inner.insert_profile_if_absent(row).await;
        if matches!(inserted, Ok(Some(_))) {
            tokio::time::sleep(self.delay).await;
        }
        inserted
    }

    async fn find_channels(&self, names: &[String]) -> dormx_session::Result<Vec<Channel>> {
        self.inner.find_channels(names).await
    }

    async fn channel_memberships(
        &self,
        user_id: &str,
    ) -> dormx_session::Result<Vec<ChannelMembership>> {
        self.inner.channel_memberships(user_id).await
    }

    async fn add_memberships(&self, rows: &[ChannelMembership]) -> dormx_session::Result<()> {
        self.inner.add_memberships(rows).await
    }
}

// ─── Launch ──────────────────────────────────────────────────

#[tokio::test]
async fn fresh_launch_settles_unauthenticated() {
    let controller = start(&MemoryIdentity::new(), &MemoryDb::new());
    assert_eq!(controller.phase(), AppPhase::Initializing);

    let state = settle(&controller, |s| s.initialized).await;
    assert!(!state.loading);
    assert!(state.user.is_none());
    assert!(!state.needs_onboarding);
    assert_eq!(state.phase(), AppPhase::Unauthenticated);
}

#[tokio::test]
async fn restored_session_with_completed_profile_is_ready() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;
    let db = MemoryDb::new();
    db.insert_profile(completed_profile("u1", "Sam"));

    let controller = start(&identity, &db);
    let state = controller.wait_until_initialized().await;

    // The profile is already there on the first initialized state.
    assert_eq!(state.profile.as_ref().map(|p| p.id.as_str()), Some("u1"));
    assert!(!state.needs_onboarding);
    assert!(!state.loading);
    assert_eq!(state.phase(), AppPhase::Ready);
    assert_eq!(controller.user_info().unwrap().name, "Sam");
}

#[tokio::test]
async fn restored_session_without_profile_needs_onboarding() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;

    let controller = start(&identity, &MemoryDb::new());
    let state = controller.wait_until_initialized().await;

    assert!(state.is_logged_in());
    assert!(state.profile.is_none());
    assert!(state.needs_onboarding);
    assert_eq!(state.phase(), AppPhase::Onboarding);
}

#[tokio::test]
async fn restore_error_still_initializes() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;
    identity.set_restore_mode(RestoreMode::Fail).await;

    let controller = start(&identity, &MemoryDb::new());
    let state = settle(&controller, |s| s.initialized).await;

    assert!(!state.loading);
    assert!(state.user.is_none());
    assert_eq!(state.phase(), AppPhase::Unauthenticated);
}

#[tokio::test]
async fn restore_panic_still_initializes() {
    let identity = MemoryIdentity::new();
    identity.set_restore_mode(RestoreMode::Panic).await;

    let controller = start(&identity, &MemoryDb::new());
    let state = settle(&controller, |s| s.initialized).await;

    assert!(!state.loading);
    assert!(state.user.is_none());
}

#[tokio::test]
async fn profile_error_during_restore_still_initializes() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;
    let db = MemoryDb::new();
    db.set_fail_fetch(true);

    let controller = start(&identity, &db);
    let state = controller.wait_until_initialized().await;

    assert!(!state.loading);
    assert!(state.is_logged_in());
    assert!(state.profile.is_none());
    assert!(state.needs_onboarding);
}

#[tokio::test]
async fn auth_change_during_restore_wins() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;
    identity.set_restore_delay(Duration::from_millis(100));
    let db = MemoryDb::new();
    db.insert_profile(completed_profile("u2", "Alex"));

    let controller = start(&identity, &db);
    let newer = MemoryIdentity::session_for(MemoryIdentity::user("u2", "u2@dorm.edu", Map::new()));
    identity.emit(AuthChange::established(AuthEvent::SignedIn, newer));

    let state = settle(&controller, |s| s.initialized && !s.loading).await;
    assert_eq!(state.user_id(), Some("u2"));
    assert_eq!(state.profile.as_ref().map(|p| p.id.as_str()), Some("u2"));
}

#[tokio::test]
async fn initialized_flips_once_when_restore_is_superseded() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;
    identity.set_restore_delay(Duration::from_millis(100));
    let db = MemoryDb::new();
    db.insert_profile(completed_profile("u2", "Alex"));

    let controller = start(&identity, &db);
    let mut rx = controller.subscribe();
    let mut seen = vec![rx.borrow_and_update().initialized];

    let newer = MemoryIdentity::session_for(MemoryIdentity::user("u2", "u2@dorm.edu", Map::new()));
    identity.emit(AuthChange::established(AuthEvent::SignedIn, newer));

    while let Ok(Ok(())) = tokio::time::timeout(Duration::from_millis(300), rx.changed()).await {
        seen.push(rx.borrow_and_update().initialized);
    }

    seen.dedup();
    assert_eq!(seen, vec![false, true]);
    let state = controller.state();
    assert_eq!(state.user_id(), Some("u2"));
    assert!(!state.loading);
}

#[tokio::test]
async fn sign_out_during_restore_wins() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;
    identity.set_restore_delay(Duration::from_millis(100));

    let controller = start(&identity, &MemoryDb::new());
    identity.emit(AuthChange::cleared(AuthEvent::SignedOut));

    let state = settle(&controller, |s| s.initialized).await;
    assert!(state.user.is_none());
    assert_eq!(state.phase(), AppPhase::Unauthenticated);
}

// ─── Sign in / sign out ──────────────────────────────────────

#[tokio::test]
async fn sign_in_loads_profile() {
    let identity = MemoryIdentity::new().with_account("u1", "sam@dorm.edu", "hunter22");
    let db = MemoryDb::new();
    db.insert_profile(completed_profile("u1", "Sam"));
    let controller = start(&identity, &db);
    controller.wait_until_initialized().await;

    let session = controller.sign_in(" sam@dorm.edu ", "hunter22").await.unwrap();
    assert_eq!(session.user.id, "u1");

    let state = settle(&controller, |s| s.profile.is_some() && !s.loading).await;
    assert_eq!(state.phase(), AppPhase::Ready);
    assert_eq!(db.fetch_calls(), 1);
}

#[tokio::test]
async fn wrong_password_reports_provider_message() {
    let identity = MemoryIdentity::new().with_account("u1", "sam@dorm.edu", "hunter22");
    let controller = start(&identity, &MemoryDb::new());
    controller.wait_until_initialized().await;

    let err = controller.sign_in("sam@dorm.edu", "wrong").await.unwrap_err();
    assert!(matches!(err, AuthError::Credential(_)));
    assert_eq!(err.message(), "Invalid login credentials");

    let state = controller.state();
    assert!(!state.loading);
    assert!(state.user.is_none());
}

#[tokio::test]
async fn network_failure_surfaces_as_connectivity() {
    let identity = MemoryIdentity::new().with_account("u1", "sam@dorm.edu", "hunter22");
    identity.set_offline(true);
    let controller = start(&identity, &MemoryDb::new());
    controller.wait_until_initialized().await;

    let err = controller.sign_in("sam@dorm.edu", "hunter22").await.unwrap_err();
    assert!(err.is_connectivity());
    assert!(!controller.state().loading);
}

#[tokio::test]
async fn sign_out_clears_identity_and_profile() {
    let identity = MemoryIdentity::new().with_account("u1", "sam@dorm.edu", "hunter22");
    let db = MemoryDb::new();
    db.insert_profile(completed_profile("u1", "Sam"));
    let controller = start(&identity, &db);
    controller.wait_until_initialized().await;

    controller.sign_in("sam@dorm.edu", "hunter22").await.unwrap();
    settle(&controller, |s| s.profile.is_some() && !s.loading).await;

    assert_eq!(controller.sign_out().await, SignOutOutcome::Revoked);
    let state = settle(&controller, |s| !s.loading).await;
    assert!(state.user.is_none());
    assert!(state.profile.is_none());
    assert!(!state.needs_onboarding);
    assert_eq!(state.phase(), AppPhase::Unauthenticated);
    assert!(identity.persisted().await.is_none());
}

#[tokio::test]
async fn sign_out_offline_still_clears_locally() {
    let identity = MemoryIdentity::new().with_account("u1", "sam@dorm.edu", "hunter22");
    let controller = start(&identity, &MemoryDb::new());
    controller.wait_until_initialized().await;
    controller.sign_in("sam@dorm.edu", "hunter22").await.unwrap();
    settle_signed_in(&controller).await;

    identity.set_offline(true);
    assert_eq!(controller.sign_out().await, SignOutOutcome::LocalOnly);

    let state = controller.state();
    assert!(state.user.is_none());
    assert!(!state.loading);
    assert_eq!(identity.sign_out_calls(), 1);
}

#[tokio::test]
async fn profile_for_signed_out_user_is_discarded() {
    let identity = MemoryIdentity::new().with_account("u1", "sam@dorm.edu", "hunter22");
    let db = MemoryDb::new();
    db.insert_profile(completed_profile("u1", "Sam"));
    db.set_fetch_delay(Duration::from_millis(100));
    let controller = start(&identity, &db);
    controller.wait_until_initialized().await;

    controller.sign_in("sam@dorm.edu", "hunter22").await.unwrap();
    controller.sign_out().await;

    // Wait for the delayed fetch to finish.
    let state = settle(&controller, |s| !s.loading).await;
    assert!(state.user.is_none());
    assert!(state.profile.is_none());
    assert_eq!(db.fetch_calls(), 1);
}

#[tokio::test]
async fn forced_logout_clears_state() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;
    let db = MemoryDb::new();
    db.insert_profile(completed_profile("u1", "Sam"));
    let controller = start(&identity, &db);
    controller.wait_until_initialized().await;

    identity.emit(AuthChange::cleared(AuthEvent::TokenInvalid));

    let state = settle(&controller, |s| s.user.is_none()).await;
    assert!(state.profile.is_none());
    assert!(!state.needs_onboarding);
}

#[tokio::test]
async fn token_refresh_keeps_cached_profile() {
    let identity = MemoryIdentity::new().with_account("u1", "sam@dorm.edu", "hunter22");
    let db = MemoryDb::new();
    db.insert_profile(completed_profile("u1", "Sam"));
    let controller = start(&identity, &db);
    controller.wait_until_initialized().await;
    controller.sign_in("sam@dorm.edu", "hunter22").await.unwrap();
    let before = settle(&controller, |s| s.profile.is_some() && !s.loading).await;

    use dormx_session::services::IdentityProvider;
    identity.refresh_session().await.unwrap();

    let after = settle(&controller, |s| s.version > before.version).await;
    assert_eq!(after.profile, before.profile);
    assert!(!after.loading);
    assert_eq!(db.fetch_calls(), 1);
}

// ─── Sign up ─────────────────────────────────────────────────

#[tokio::test]
async fn sign_up_seeds_profile_and_needs_onboarding() {
    let identity = MemoryIdentity::new();
    let db = MemoryDb::new();
    let controller = start(&identity, &db);
    controller.wait_until_initialized().await;

    let outcome = controller
        .sign_up("new@dorm.edu", "pw123456", Some(ProfileSeed::named("Sam")))
        .await
        .unwrap();
    assert!(outcome.session.is_some());
    assert_eq!(
        outcome.user.user_metadata.get("name").and_then(|v| v.as_str()),
        Some("Sam")
    );

    let state = settle(&controller, |s| s.profile.is_some() && !s.loading).await;
    assert!(state.needs_onboarding);
    assert_eq!(state.phase(), AppPhase::Onboarding);
    assert_eq!(db.profile(&outcome.user.id).unwrap().name.as_deref(), Some("Sam"));
}

#[tokio::test]
async fn failed_seed_is_retried_on_next_fetch() {
    let identity = MemoryIdentity::new();
    let db = MemoryDb::new();
    db.set_fail_upsert(true);
    let controller = start(&identity, &db);
    controller.wait_until_initialized().await;

    let outcome = controller
        .sign_up("new@dorm.edu", "pw123456", Some(ProfileSeed::named("Sam")))
        .await
        .unwrap();
    let user_id = outcome.user.id.clone();

    let state = settle_signed_in(&controller).await;
    assert!(state.needs_onboarding);

    db.set_fail_upsert(false);
    let profile = controller.fetch_user_profile(&user_id).await.unwrap();
    assert_eq!(profile.name.as_deref(), Some("Sam"));
    assert!(!profile.onboarding_completed);
    assert_eq!(controller.user_info().unwrap().name, "Sam");
}

#[tokio::test]
async fn late_seed_never_undoes_onboarding() {
    let identity = MemoryIdentity::new();
    let db = MemoryDb::new();
    db.set_fail_upsert(true);
    let slow = SlowSeedDb {
        inner: db.clone(),
        delay: Duration::from_millis(200),
    };
    let controller = SessionController::start(
        Arc::new(identity.clone()),
        Arc::new(slow),
        ControllerOptions::default(),
    );
    controller.wait_until_initialized().await;

    let outcome = controller
        .sign_up("new@dorm.edu", "pw123456", Some(ProfileSeed::named("Sam")))
        .await
        .unwrap();
    let user_id = outcome.user.id.clone();
    settle_signed_in(&controller).await;
    db.set_fail_upsert(false);

    // The parked seed is written by the fetch while onboarding runs.
    let (_, onboarded) = tokio::join!(controller.fetch_user_profile(&user_id), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.complete_onboarding(onboarding_fields()).await
    });

    assert!(onboarded.unwrap().onboarding_completed);
    let stored = db.profile(&user_id).unwrap();
    assert!(stored.onboarding_completed);
    assert_eq!(stored.dorm_name.as_deref(), Some("Hall A"));

    let state = settle(&controller, |s| !s.loading).await;
    assert!(!state.needs_onboarding);
    assert_eq!(state.phase(), AppPhase::Ready);

    let refetched = controller.fetch_user_profile(&user_id).await.unwrap();
    assert!(refetched.onboarding_completed);
    assert!(db.profile(&user_id).unwrap().onboarding_completed);
    assert!(!controller.state().needs_onboarding);
}

#[tokio::test]
async fn sign_up_awaiting_confirmation_stays_signed_out() {
    let identity = MemoryIdentity::new();
    identity.set_confirm_email(true);
    let db = MemoryDb::new();
    let controller = start(&identity, &db);
    controller.wait_until_initialized().await;

    let outcome = controller
        .sign_up("new@dorm.edu", "pw123456", Some(ProfileSeed::named("Sam")))
        .await
        .unwrap();
    assert!(outcome.session.is_none());

    let state = controller.state();
    assert!(state.user.is_none());
    assert!(!state.loading);
    assert_eq!(db.upsert_calls(), 0);
}

#[tokio::test]
async fn sign_up_rejects_bad_email() {
    let controller = start(&MemoryIdentity::new(), &MemoryDb::new());
    controller.wait_until_initialized().await;

    let err = controller.sign_up("not-an-email", "pw", None).await.unwrap_err();
    assert!(matches!(err, AuthError::Validation(_)));
}

#[tokio::test]
async fn duplicate_sign_up_reports_provider_message() {
    let identity = MemoryIdentity::new().with_account("u1", "sam@dorm.edu", "hunter22");
    let controller = start(&identity, &MemoryDb::new());
    controller.wait_until_initialized().await;

    let err = controller
        .sign_up("sam@dorm.edu", "pw123456", None)
        .await
        .unwrap_err();
    assert_eq!(err.message(), "User already registered");
    assert!(!controller.state().loading);
}

// ─── Onboarding ──────────────────────────────────────────────

#[tokio::test]
async fn onboarding_requires_a_user() {
    let controller = start(&MemoryIdentity::new(), &MemoryDb::new());
    controller.wait_until_initialized().await;

    let err = controller
        .complete_onboarding(onboarding_fields())
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::NotAuthenticated));
}

#[tokio::test]
async fn onboarding_validates_before_any_write() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;
    let db = MemoryDb::new();
    let controller = start(&identity, &db);
    controller.wait_until_initialized().await;

    let err = controller
        .complete_onboarding(OnboardingFields::new("  ", "Hall A"))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthError::Validation(_)));
    assert_eq!(db.upsert_calls(), 0);
}

#[tokio::test]
async fn onboarding_completes_and_joins_default_channels() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;
    let db = db_with_channels();
    let controller = start(&identity, &db);
    let state = controller.wait_until_initialized().await;
    assert!(state.needs_onboarding);

    let profile = controller
        .complete_onboarding(onboarding_fields())
        .await
        .unwrap();
    assert!(profile.onboarding_completed);
    assert_eq!(profile.dorm_name.as_deref(), Some("Hall A"));

    let state = controller.state();
    assert!(!state.needs_onboarding);
    assert!(!state.loading);
    assert_eq!(state.phase(), AppPhase::Ready);
    assert_eq!(db.memberships_of("u1").len(), 3);

    // Running it again does not duplicate memberships.
    controller
        .complete_onboarding(onboarding_fields())
        .await
        .unwrap();
    assert_eq!(db.memberships_of("u1").len(), 3);
}

#[tokio::test]
async fn sign_out_during_onboarding_skips_channel_join() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;
    let db = db_with_channels();
    let controller = start(&identity, &db);
    controller.wait_until_initialized().await;
    db.set_fetch_delay(Duration::from_millis(100));

    let (onboarded, signed_out) = tokio::join!(
        controller.complete_onboarding(onboarding_fields()),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            controller.sign_out().await
        }
    );

    assert!(onboarded.unwrap().onboarding_completed);
    assert_eq!(signed_out, SignOutOutcome::Revoked);
    assert!(db.memberships_of("u1").is_empty());
    let state = controller.state();
    assert!(state.user.is_none());
    assert!(state.profile.is_none());
}

#[tokio::test]
async fn onboarding_succeeds_when_channel_join_fails() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;
    let db = db_with_channels();
    db.set_fail_channels(true);
    let controller = start(&identity, &db);
    controller.wait_until_initialized().await;

    let profile = controller
        .complete_onboarding(onboarding_fields())
        .await
        .unwrap();
    assert!(profile.onboarding_completed);
    assert!(!controller.state().needs_onboarding);
    assert!(db.memberships_of("u1").is_empty());
}

#[tokio::test]
async fn failed_onboarding_write_leaves_state_unchanged() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;
    let db = MemoryDb::new();
    let controller = start(&identity, &db);
    let before = controller.wait_until_initialized().await;

    db.set_fail_upsert(true);
    let err = controller
        .complete_onboarding(onboarding_fields())
        .await
        .unwrap_err();
    assert!(err.is_connectivity());

    let after = controller.state();
    assert_eq!(after.profile, before.profile);
    assert!(after.needs_onboarding);
    assert!(!after.loading);
}

// ─── Profile fetch ───────────────────────────────────────────

#[tokio::test]
async fn failed_fetch_keeps_cached_profile() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;
    let db = MemoryDb::new();
    db.insert_profile(completed_profile("u1", "Sam"));
    let controller = start(&identity, &db);
    let before = controller.wait_until_initialized().await;

    db.set_fail_fetch(true);
    assert!(controller.fetch_user_profile("u1").await.is_none());

    let after = controller.state();
    assert_eq!(after.profile, before.profile);
    assert!(!after.loading);
}

#[tokio::test]
async fn fetch_for_other_user_does_not_touch_state() {
    let identity = MemoryIdentity::new();
    identity.restore("u1", "u1@dorm.edu").await;
    let db = MemoryDb::new();
    db.insert_profile(completed_profile("u2", "Alex"));
    let controller = start(&identity, &db);
    controller.wait_until_initialized().await;

    let other = controller.fetch_user_profile("u2").await.unwrap();
    assert_eq!(other.id, "u2");
    assert!(controller.state().profile.is_none());
}

// ─── Teardown ────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_releases_subscription_once() {
    let identity = MemoryIdentity::new().with_account("u1", "sam@dorm.edu", "hunter22");
    let controller = start(&identity, &MemoryDb::new());
    controller.wait_until_initialized().await;
    assert_eq!(identity.subscriber_count(), 1);

    controller.shutdown().await;
    controller.shutdown().await;
    assert_eq!(identity.subscriber_count(), 0);
    assert!(controller.is_shut_down());

    // Results arriving after teardown never reach the state.
    controller.sign_in("sam@dorm.edu", "hunter22").await.unwrap();
    assert!(controller.state().user.is_none());
}

#[tokio::test]
async fn dropping_controller_releases_subscription() {
    let identity = MemoryIdentity::new();
    let controller = start(&identity, &MemoryDb::new());
    controller.wait_until_initialized().await;
    drop(controller);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(identity.subscriber_count(), 0);
}

#[tokio::test]
async fn readers_see_every_settled_transition() {
    let identity = MemoryIdentity::new().with_account("u1", "sam@dorm.edu", "hunter22");
    let db = MemoryDb::new();
    db.insert_profile(completed_profile("u1", "Sam"));
    let controller = start(&identity, &db);
    let mut rx = controller.subscribe();
    controller.wait_until_initialized().await;

    controller.sign_in("sam@dorm.edu", "hunter22").await.unwrap();
    let state = tokio::time::timeout(
        SETTLE_TIMEOUT,
        rx.wait_for(|s| s.phase() == AppPhase::Ready && !s.loading),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(state.user_info().unwrap().dorm_name.as_deref(), Some("Hall A"));
}
