// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Profile rows stored in the `profiles` table, plus the onboarding form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Cow;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;
use validator::{Validate, ValidationError, ValidationErrors};

/// Application-level user record, keyed 1:1 by user id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "app/src/generated/")
)]
pub struct Profile {
    /// Same value as the identity's user id
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    /// Resident assistant flag
    #[serde(default, deserialize_with = "bool_or_null")]
    pub is_ra: bool,
    #[serde(default)]
    pub dorm_name: Option<String>,
    #[serde(default)]
    pub room_number: Option<String>,
    #[serde(default, deserialize_with = "bool_or_null")]
    pub onboarding_completed: bool,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn bool_or_null<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or(false))
}

/// Row written by an upsert keyed on `id`.
///
/// `None` columns are omitted so a merge keeps whatever the row already holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileUpsert {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_ra: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dorm_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_number: Option<String>,
    pub onboarding_completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl ProfileUpsert {
    /// Seed row written right after sign-up. Never marks onboarding complete.
    pub fn from_seed(user_id: &str, email: Option<&str>, seed: &ProfileSeed) -> Self {
        Self {
            id: user_id.to_string(),
            email: email.map(str::to_string),
            name: seed.name.as_deref().map(str::trim).map(str::to_string),
            bio: None,
            avatar_url: None,
            is_ra: None,
            dorm_name: None,
            room_number: None,
            onboarding_completed: false,
            updated_at: Utc::now(),
        }
    }

    /// Row that completes onboarding for `user_id`.
    pub fn from_onboarding(user_id: &str, email: Option<&str>, fields: &OnboardingFields) -> Self {
        Self {
            id: user_id.to_string(),
            email: email.map(str::to_string),
            name: Some(fields.display_name.trim().to_string()),
            bio: non_blank(fields.bio.as_deref()),
            avatar_url: non_blank(fields.avatar_url.as_deref()),
            is_ra: Some(fields.is_ra),
            dorm_name: Some(fields.dorm_building.trim().to_string()),
            room_number: non_blank(fields.room_number.as_deref()),
            onboarding_completed: true,
            updated_at: Utc::now(),
        }
    }

    /// Profile as it would read back after this upsert on an empty table.
    pub fn into_profile(self, created_at: DateTime<Utc>) -> Profile {
        Profile {
            id: self.id,
            email: self.email,
            name: self.name,
            bio: self.bio,
            avatar_url: self.avatar_url,
            is_ra: self.is_ra.unwrap_or(false),
            dorm_name: self.dorm_name,
            room_number: self.room_number,
            onboarding_completed: self.onboarding_completed,
            created_at: Some(created_at),
            updated_at: Some(self.updated_at),
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Optional data captured on the sign-up form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileSeed {
    pub name: Option<String>,
}

impl ProfileSeed {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.as_deref().map_or(true, |n| n.trim().is_empty())
    }
}

/// Onboarding form submitted by a freshly signed-up member.
#[derive(Debug, Clone, Default, Validate)]
pub struct OnboardingFields {
    #[validate(
        custom(function = "not_blank", message = "Please enter a display name"),
        length(max = 64)
    )]
    pub display_name: String,
    #[validate(length(max = 500))]
    pub bio: Option<String>,
    #[validate(url(message = "Avatar must be a valid URL"))]
    pub avatar_url: Option<String>,
    pub is_ra: bool,
    #[validate(
        custom(function = "not_blank", message = "Please enter your dorm building"),
        length(max = 100)
    )]
    pub dorm_building: String,
    #[validate(length(max = 20))]
    pub room_number: Option<String>,
}

impl OnboardingFields {
    pub fn new(display_name: impl Into<String>, dorm_building: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            dorm_building: dorm_building.into(),
            ..Default::default()
        }
    }

    /// Validate locally, flattening field errors into one message.
    pub fn check(&self) -> Result<(), String> {
        self.validate().map_err(|errors| describe(&errors))
    }
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank"));
    }
    Ok(())
}

/// Turn validator output into a stable, readable message.
fn describe(errors: &ValidationErrors) -> String {
    let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
    fields.sort_by(|a, b| a.0.cmp(&b.0));

    fields
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| {
                let detail = e
                    .message
                    .clone()
                    .unwrap_or_else(|| Cow::Owned(format!("failed {}", e.code)));
                format!("{}: {}", field, detail)
            })
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Accept ids stored as either text/uuid or integer columns.
fn id_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// Chat channel, looked up by name when auto-joining.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(deserialize_with = "id_string")]
    pub id: String,
    pub name: String,
}

/// Row in `chat_members`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMembership {
    pub user_id: String,
    #[serde(deserialize_with = "id_string")]
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined_at: Option<DateTime<Utc>>,
}
