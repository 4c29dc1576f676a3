// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Record storage layer.
//!
//! The backend owns every row; the client only reads and upserts through the
//! [`RecordStore`] port.

pub mod memory;
pub mod postgrest;

pub use memory::MemoryDb;
pub use postgrest::PostgrestDb;

use crate::error::Result;
use crate::models::{Channel, ChannelMembership, Profile, ProfileUpsert};
use async_trait::async_trait;

/// Table names as constants.
pub mod tables {
    pub const PROFILES: &str = "profiles";
    pub const CHANNELS: &str = "channels";
    pub const CHAT_MEMBERS: &str = "chat_members";
}

/// Record-storage operations the session controller depends on.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch the profile keyed by `user_id`; `Ok(None)` when no row exists.
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>>;

    /// Insert or merge the profile row keyed by `row.id`, returning the stored row.
    async fn upsert_profile(&self, row: &ProfileUpsert) -> Result<Profile>;

    /// Insert the row unless one already exists for `row.id`.
    ///
    /// Returns the inserted row, or `Ok(None)` when an existing row was left
    /// untouched.
    async fn insert_profile_if_absent(&self, row: &ProfileUpsert) -> Result<Option<Profile>>;

    /// Channels whose name is one of `names`.
    async fn find_channels(&self, names: &[String]) -> Result<Vec<Channel>>;

    async fn channel_memberships(&self, user_id: &str) -> Result<Vec<ChannelMembership>>;

    async fn add_memberships(&self, rows: &[ChannelMembership]) -> Result<()>;
}
