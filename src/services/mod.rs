// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Services module - session bootstrap and identity adapters.

pub mod bootstrap;
pub mod gotrue;
pub mod identity;
pub mod memory_identity;
pub mod session_store;

pub use bootstrap::{ControllerOptions, SessionController, SignOutOutcome};
pub use gotrue::{GoTrueClient, SupabaseAuth};
pub use identity::{AuthBroadcaster, AuthSubscription, IdentityProvider};
pub use memory_identity::{MemoryIdentity, RestoreMode};
pub use session_store::{FileSessionStorage, MemorySessionStorage, SessionCell, SessionStorage};
