// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-memory record store for tests and offline runs.
//!
//! Failures and latency can be injected to exercise the controller's
//! error paths.

use crate::db::RecordStore;
use crate::error::{AuthError, Result};
use crate::models::{Channel, ChannelMembership, Profile, ProfileUpsert};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct Inner {
    profiles: DashMap<String, Profile>,
    channels: DashMap<String, Channel>,
    /// (user_id, channel_id) -> membership
    members: DashMap<(String, String), ChannelMembership>,
    fail_fetch: AtomicBool,
    fail_upsert: AtomicBool,
    fail_channels: AtomicBool,
    fetch_delay_ms: AtomicU64,
    fetch_calls: AtomicUsize,
    upsert_calls: AtomicUsize,
}

/// Record store held entirely in process memory.
#[derive(Clone, Default)]
pub struct MemoryDb {
    inner: Arc<Inner>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with the given channels already created.
    pub fn with_channels<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let db = Self::new();
        for (i, name) in names.into_iter().enumerate() {
            let name = name.into();
            db.inner.channels.insert(
                name.clone(),
                Channel {
                    id: format!("ch-{}", i + 1),
                    name,
                },
            );
        }
        db
    }

    pub fn insert_profile(&self, profile: Profile) {
        self.inner.profiles.insert(profile.id.clone(), profile);
    }

    pub fn profile(&self, user_id: &str) -> Option<Profile> {
        self.inner.profiles.get(user_id).map(|p| p.clone())
    }

    pub fn memberships_of(&self, user_id: &str) -> Vec<ChannelMembership> {
        let mut rows: Vec<_> = self
            .inner
            .members
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        rows.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        rows
    }

    pub fn set_fail_fetch(&self, fail: bool) {
        self.inner.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_upsert(&self, fail: bool) {
        self.inner.fail_upsert.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_channels(&self, fail: bool) {
        self.inner.fail_channels.store(fail, Ordering::SeqCst);
    }

    /// Delay every profile fetch by `delay`.
    pub fn set_fetch_delay(&self, delay: Duration) {
        self.inner
            .fetch_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.inner.fetch_calls.load(Ordering::SeqCst)
    }

    /// Profile writes of either kind, including failed ones.
    pub fn upsert_calls(&self) -> usize {
        self.inner.upsert_calls.load(Ordering::SeqCst)
    }

    fn offline() -> AuthError {
        AuthError::Connectivity("record store unavailable (injected)".to_string())
    }
}

#[async_trait]
impl RecordStore for MemoryDb {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        self.inner.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.inner.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.inner.fail_fetch.load(Ordering::SeqCst) {
            return Err(Self::offline());
        }
        Ok(self.profile(user_id))
    }

    async fn upsert_profile(&self, row: &ProfileUpsert) -> Result<Profile> {
        self.inner.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_upsert.load(Ordering::SeqCst) {
            return Err(Self::offline());
        }

        let mut entry = self
            .inner
            .profiles
            .entry(row.id.clone())
            .or_insert_with(|| row.clone().into_profile(Utc::now()));
        let profile = entry.value_mut();
        // merge-duplicates: only the columns present in the row change
        if let Some(v) = &row.email {
            profile.email = Some(v.clone());
        }
        if let Some(v) = &row.name {
            profile.name = Some(v.clone());
        }
        if let Some(v) = &row.bio {
            profile.bio = Some(v.clone());
        }
        if let Some(v) = &row.avatar_url {
            profile.avatar_url = Some(v.clone());
        }
        if let Some(v) = row.is_ra {
            profile.is_ra = v;
        }
        if let Some(v) = &row.dorm_name {
            profile.dorm_name = Some(v.clone());
        }
        if let Some(v) = &row.room_number {
            profile.room_number = Some(v.clone());
        }
        profile.onboarding_completed = row.onboarding_completed;
        profile.updated_at = Some(row.updated_at);

        Ok(profile.clone())
    }

    async fn insert_profile_if_absent(&self, row: &ProfileUpsert) -> Result<Option<Profile>> {
        self.inner.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_upsert.load(Ordering::SeqCst) {
            return Err(Self::offline());
        }

        match self.inner.profiles.entry(row.id.clone()) {
            Entry::Occupied(_) => Ok(None),
            Entry::Vacant(slot) => {
                let profile = row.clone().into_profile(Utc::now());
                slot.insert(profile.clone());
                Ok(Some(profile))
            }
        }
    }

    async fn find_channels(&self, names: &[String]) -> Result<Vec<Channel>> {
        if self.inner.fail_channels.load(Ordering::SeqCst) {
            return Err(Self::offline());
        }
        Ok(names
            .iter()
            .filter_map(|n| self.inner.channels.get(n).map(|c| c.clone()))
            .collect())
    }

    async fn channel_memberships(&self, user_id: &str) -> Result<Vec<ChannelMembership>> {
        if self.inner.fail_channels.load(Ordering::SeqCst) {
            return Err(Self::offline());
        }
        Ok(self.memberships_of(user_id))
    }

    async fn add_memberships(&self, rows: &[ChannelMembership]) -> Result<()> {
        if self.inner.fail_channels.load(Ordering::SeqCst) {
            return Err(Self::offline());
        }
        for row in rows {
            self.inner
                .members
                .entry((row.user_id.clone(), row.channel_id.clone()))
                .or_insert_with(|| row.clone());
        }
        Ok(())
    }
}
