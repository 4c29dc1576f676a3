// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Bootstrap state published to every screen, and the views derived from it.

use crate::models::{AuthenticatedUser, Profile};
use serde::Serialize;
use serde_json::{Map, Value};
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Snapshot of the session controller's state.
///
/// Only the controller writes it; everything else reads clones from the
/// watch channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "app/src/generated/")
)]
pub struct BootstrapState {
    pub user: Option<AuthenticatedUser>,
    pub profile: Option<Profile>,
    pub loading: bool,
    pub initialized: bool,
    pub needs_onboarding: bool,
    /// Bumped on every auth-driven identity change
    #[cfg_attr(feature = "binding-generation", ts(type = "number"))]
    pub version: u64,
    #[serde(skip)]
    #[cfg_attr(feature = "binding-generation", ts(skip))]
    pub(crate) in_flight: usize,
}

impl Default for BootstrapState {
    fn default() -> Self {
        Self {
            user: None,
            profile: None,
            loading: true,
            initialized: false,
            needs_onboarding: false,
            version: 0,
            in_flight: 0,
        }
    }
}

impl BootstrapState {
    pub fn is_logged_in(&self) -> bool {
        self.user.is_some()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// Which top-level screen variant the app should show.
    pub fn phase(&self) -> AppPhase {
        match (&self.user, self.initialized) {
            (_, false) => AppPhase::Initializing,
            (None, true) => AppPhase::Unauthenticated,
            (Some(_), true) if self.needs_onboarding => AppPhase::Onboarding,
            (Some(_), true) => AppPhase::Ready,
        }
    }

    /// Merged identity and profile view; `None` when signed out.
    pub fn user_info(&self) -> Option<UserInfo> {
        self.user
            .as_ref()
            .map(|user| UserInfo::merge(user, self.profile.as_ref()))
    }

    /// Re-derive the computed fields after any mutation.
    pub(crate) fn settle(&mut self) {
        self.needs_onboarding = match (&self.user, &self.profile) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(_), Some(profile)) => !profile.onboarding_completed,
        };
        self.loading = !self.initialized || self.in_flight > 0;
    }

    pub(crate) fn clear_identity(&mut self) {
        self.user = None;
        self.profile = None;
        self.version += 1;
        self.settle();
    }
}

/// Top-level UI gate derived from [`BootstrapState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "app/src/generated/")
)]
#[serde(rename_all = "snake_case")]
pub enum AppPhase {
    Initializing,
    Unauthenticated,
    Onboarding,
    Ready,
}

/// Convenience view merging identity and profile; profile values win.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "app/src/generated/")
)]
pub struct UserInfo {
    pub id: String,
    pub email: Option<String>,
    pub name: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub is_ra: bool,
    pub dorm_name: Option<String>,
    pub room_number: Option<String>,
    pub onboarding_completed: bool,
    /// User metadata keys not covered by the fields above
    #[cfg_attr(feature = "binding-generation", ts(type = "Record<string, unknown>"))]
    pub metadata: Map<String, Value>,
}

impl UserInfo {
    pub fn merge(user: &AuthenticatedUser, profile: Option<&Profile>) -> Self {
        let meta_str = |key: &str| {
            user.user_metadata
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let meta_bool = |key: &str| user.user_metadata.get(key).and_then(Value::as_bool);

        let profile_name = profile
            .and_then(|p| p.name.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let name = profile_name
            .or_else(|| user.metadata_name())
            .or_else(|| user.email_local_part())
            .unwrap_or("Member")
            .to_string();

        let mut metadata = user.user_metadata.clone();
        for key in [
            "name",
            "bio",
            "avatar_url",
            "is_ra",
            "dorm_name",
            "room_number",
        ] {
            metadata.remove(key);
        }

        Self {
            id: user.id.clone(),
            email: profile
                .and_then(|p| p.email.clone())
                .or_else(|| user.email.clone()),
            name,
            bio: profile
                .and_then(|p| p.bio.clone())
                .or_else(|| meta_str("bio")),
            avatar_url: profile
                .and_then(|p| p.avatar_url.clone())
                .or_else(|| meta_str("avatar_url")),
            is_ra: profile
                .map(|p| p.is_ra)
                .or_else(|| meta_bool("is_ra"))
                .unwrap_or(false),
            dorm_name: profile
                .and_then(|p| p.dorm_name.clone())
                .or_else(|| meta_str("dorm_name")),
            room_number: profile
                .and_then(|p| p.room_number.clone())
                .or_else(|| meta_str("room_number")),
            onboarding_completed: profile.is_some_and(|p| p.onboarding_completed),
            metadata,
        }
    }
}
