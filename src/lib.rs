// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! DormX session bootstrap
//!
//! This crate owns the app-wide authentication state for the DormX dorm
//! community app: it restores the persisted session at launch, follows
//! auth changes pushed by the hosted identity service, keeps the member's
//! profile cached alongside the identity, and derives which top-level
//! screen (sign in, onboarding, main app) should be shown.
//!
//! The hosted backend is reached through two ports,
//! [`services::IdentityProvider`] and [`db::RecordStore`], with HTTP
//! adapters for Supabase GoTrue and PostgREST and in-memory adapters for
//! tests.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod telemetry;

pub use error::{AuthError, Result};
pub use models::{AppPhase, BootstrapState, UserInfo};
pub use services::{ControllerOptions, SessionController, SignOutOutcome};
