// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Session and identity records issued by the identity provider.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

/// Identity record mirrored from the provider for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "app/src/generated/")
)]
pub struct AuthenticatedUser {
    /// Provider-issued user id (also the `profiles` primary key)
    pub id: String,
    pub email: Option<String>,
    /// Free-form metadata supplied at sign-up (e.g. `name`)
    #[serde(default)]
    #[cfg_attr(feature = "binding-generation", ts(type = "Record<string, unknown>"))]
    pub user_metadata: Map<String, Value>,
    #[serde(default)]
    #[cfg_attr(feature = "binding-generation", ts(type = "Record<string, unknown>"))]
    pub app_metadata: Map<String, Value>,
    pub created_at: Option<DateTime<Utc>>,
}

impl AuthenticatedUser {
    /// `name` from user metadata, if present and non-blank.
    pub fn metadata_name(&self) -> Option<&str> {
        self.user_metadata
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Local part of the email address.
    pub fn email_local_part(&self) -> Option<&str> {
        self.email
            .as_deref()
            .and_then(|e| e.split('@').next())
            .filter(|s| !s.is_empty())
    }
}

/// Opaque credential bundle proving an authenticated identity.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub user: AuthenticatedUser,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    /// True when the access token expires within `margin` of `now`.
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        now + margin >= self.expires_at
    }
}

// Tokens stay out of logs.
impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user.id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Kind of auth state change emitted by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    InitialSession,
    SignedIn,
    SignedUp,
    TokenRefreshed,
    UserUpdated,
    SignedOut,
    TokenInvalid,
}

impl AuthEvent {
    /// Whether the event clears the current session.
    pub fn clears_session(self) -> bool {
        matches!(self, AuthEvent::SignedOut | AuthEvent::TokenInvalid)
    }
}

/// A single notification on the auth change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<Session>,
}

impl AuthChange {
    pub fn established(event: AuthEvent, session: Session) -> Self {
        Self {
            event,
            session: Some(session),
        }
    }

    pub fn cleared(event: AuthEvent) -> Self {
        Self {
            event,
            session: None,
        }
    }
}

/// Result of creating a new identity.
///
/// `session` is `None` when the provider requires email confirmation before
/// the first sign-in.
#[derive(Debug, Clone)]
pub struct SignUpOutcome {
    pub user: AuthenticatedUser,
    pub session: Option<Session>,
}
