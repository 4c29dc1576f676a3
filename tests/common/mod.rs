// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use chrono::Utc;
use dormx_session::config::{Config, DEFAULT_CHANNELS};
use dormx_session::db::MemoryDb;
use dormx_session::models::{BootstrapState, OnboardingFields, Profile};
use dormx_session::services::MemoryIdentity;
use dormx_session::{ControllerOptions, SessionController};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any state transition in tests.
#[allow(dead_code)]
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Start a controller over in-memory adapters.
#[allow(dead_code)]
pub fn start(identity: &MemoryIdentity, db: &MemoryDb) -> SessionController {
    SessionController::start(
        Arc::new(identity.clone()),
        Arc::new(db.clone()),
        ControllerOptions::default(),
    )
}

/// Record store with the default channels already created.
#[allow(dead_code)]
pub fn db_with_channels() -> MemoryDb {
    MemoryDb::with_channels(DEFAULT_CHANNELS)
}

/// Wait until `predicate` holds, failing the test after [`SETTLE_TIMEOUT`].
#[allow(dead_code)]
pub async fn settle(
    controller: &SessionController,
    predicate: impl FnMut(&BootstrapState) -> bool,
) -> BootstrapState {
    tokio::time::timeout(SETTLE_TIMEOUT, controller.wait_for(predicate))
        .await
        .expect("state never settled")
}

/// Wait for a signed-in user with no operation in flight.
#[allow(dead_code)]
pub async fn settle_signed_in(controller: &SessionController) -> BootstrapState {
    settle(controller, |s| s.initialized && s.user.is_some() && !s.loading).await
}

#[allow(dead_code)]
pub fn completed_profile(user_id: &str, name: &str) -> Profile {
    Profile {
        id: user_id.to_string(),
        email: Some(format!("{}@dorm.edu", user_id)),
        name: Some(name.to_string()),
        bio: None,
        avatar_url: None,
        is_ra: false,
        dorm_name: Some("Hall A".to_string()),
        room_number: Some("101".to_string()),
        onboarding_completed: true,
        created_at: Some(Utc::now()),
        updated_at: Some(Utc::now()),
    }
}

#[allow(dead_code)]
pub fn onboarding_fields() -> OnboardingFields {
    let mut fields = OnboardingFields::new("Sam Rivera", "Hall A");
    fields.room_number = Some("204".to_string());
    fields.bio = Some("Second year, loves climbing".to_string());
    fields
}

/// Config pointing at a mock HTTP server.
#[allow(dead_code)]
pub fn config_for(base_url: &str) -> Config {
    let mut config = Config::test_default();
    config.supabase_url = base_url.trim_end_matches('/').to_string();
    config
}
