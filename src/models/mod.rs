// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Data models for the application.

pub mod profile;
pub mod session;
pub mod state;

pub use profile::{
    Channel, ChannelMembership, OnboardingFields, Profile, ProfileSeed, ProfileUpsert,
};
pub use session::{AuthChange, AuthEvent, AuthenticatedUser, Session, SignUpOutcome};
pub use state::{AppPhase, BootstrapState, UserInfo};
