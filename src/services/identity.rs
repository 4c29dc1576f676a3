// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Identity provider port and its change-notification stream.

use crate::error::Result;
use crate::models::{AuthChange, Session, SignUpOutcome};
use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

/// Capacity of the auth change broadcast; changes are rare.
pub const AUTH_CHANNEL_CAPACITY: usize = 32;

/// Operations the session controller needs from the identity provider.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// The currently persisted session, refreshed if it is about to expire.
    async fn get_session(&self) -> Result<Option<Session>>;

    /// Subscribe to auth state changes. Dropping the subscription releases it.
    fn subscribe(&self) -> AuthSubscription;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session>;

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Map<String, Value>,
    ) -> Result<SignUpOutcome>;

    /// Invalidate the session remotely. Local persistence is cleared even when
    /// the remote call fails.
    async fn sign_out(&self) -> Result<()>;

    /// Exchange the refresh token for a new session.
    async fn refresh_session(&self) -> Result<Option<Session>>;
}

/// Live subscription to an identity provider's change stream.
#[derive(Debug)]
pub struct AuthSubscription {
    rx: broadcast::Receiver<AuthChange>,
}

impl AuthSubscription {
    pub fn new(rx: broadcast::Receiver<AuthChange>) -> Self {
        Self { rx }
    }

    /// Next change, or `None` once the provider is gone.
    ///
    /// Lagged receivers skip ahead; only the latest state matters.
    pub async fn recv(&mut self) -> Option<AuthChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Auth change subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = AuthChange> + Send {
        stream::unfold(self, |mut sub| async move {
            let change = sub.recv().await?;
            Some((change, sub))
        })
    }
}

/// Broadcast half shared by provider implementations.
#[derive(Debug, Clone)]
pub struct AuthBroadcaster {
    tx: broadcast::Sender<AuthChange>,
}

impl Default for AuthBroadcaster {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(AUTH_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl AuthBroadcaster {
    pub fn subscribe(&self) -> AuthSubscription {
        AuthSubscription::new(self.tx.subscribe())
    }

    pub fn emit(&self, change: AuthChange) {
        tracing::debug!(event = ?change.event, "Auth state changed");
        // No receivers is fine: nobody is listening yet.
        let _ = self.tx.send(change);
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
