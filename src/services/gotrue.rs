// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Hosted identity provider (GoTrue REST API) client.
//!
//! Handles:
//! - Password sign-in and sign-up
//! - Sign-out (remote session revocation)
//! - Token refresh when expiring, in the foreground and in the background
//! - Session persistence and auth change notifications

use crate::config::Config;
use crate::error::{AuthError, Result};
use crate::models::{AuthChange, AuthEvent, AuthenticatedUser, Session, SignUpOutcome};
use crate::services::identity::{AuthBroadcaster, AuthSubscription, IdentityProvider};
use crate::services::session_store::{SessionCell, SessionStorage};
use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Margin before token expiration when we proactively refresh (5 minutes).
const TOKEN_REFRESH_MARGIN_SECS: i64 = 5 * 60;

/// Which endpoint a response came from; decides how rejections are classified.
#[derive(Clone, Copy)]
enum Endpoint {
    Credentials,
    Other,
}

/// Raw GoTrue API client.
#[derive(Clone)]
pub struct GoTrueClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
}

impl GoTrueClient {
    /// Create a client for `{supabase_url}/auth/v1`.
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            http,
            base_url: format!("{}/auth/v1", config.supabase_url),
            anon_key: config.supabase_anon_key.clone(),
        })
    }

    /// Exchange email and password for a session.
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let url = format!("{}/token?grant_type=password", self.base_url);
        let body = serde_json::json!({ "email": email, "password": password });

        let response = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await?;

        let token: TokenResponse = check_response_json(response, Endpoint::Credentials).await?;
        Ok(token.into_session())
    }

    /// Create a new identity.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: &Map<String, Value>,
    ) -> Result<SignUpOutcome> {
        let url = format!("{}/signup", self.base_url);
        let body = serde_json::json!({
            "email": email,
            "password": password,
            "data": metadata,
        });

        let response = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await?;

        let parsed: SignUpResponse = check_response_json(response, Endpoint::Credentials).await?;
        Ok(match parsed {
            SignUpResponse::Session(token) => {
                let session = token.into_session();
                SignUpOutcome {
                    user: session.user.clone(),
                    session: Some(session),
                }
            }
            SignUpResponse::PendingConfirmation(user) => SignUpOutcome {
                user,
                session: None,
            },
        })
    }

    /// Refresh an expired access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Session> {
        let url = format!("{}/token?grant_type=refresh_token", self.base_url);
        let body = serde_json::json!({ "refresh_token": refresh_token });

        let response = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| match AuthError::from(e) {
                AuthError::Connectivity(msg) => {
                    AuthError::Connectivity(format!("Token refresh request failed: {}", msg))
                }
                other => other,
            })?;

        let token: TokenResponse = check_response_json(response, Endpoint::Credentials).await?;
        Ok(token.into_session())
    }

    /// Revoke the session server-side.
    pub async fn sign_out(&self, access_token: &str) -> Result<()> {
        let url = format!("{}/logout", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token)
            .send()
            .await?;

        check_response(response, Endpoint::Other).await?;
        tracing::info!("Remote sign-out successful");
        Ok(())
    }

    /// Probe whether the identity service is reachable.
    pub async fn health(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .header("apikey", &self.anon_key)
            .send()
            .await?;
        check_response(response, Endpoint::Other).await?;
        Ok(())
    }
}

/// Session payload returned by the token and signup endpoints.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    token_type: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    user: AuthenticatedUser,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let expires_at = self
            .expires_at
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(|| Utc::now() + Duration::seconds(self.expires_in.unwrap_or(3600)));

        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type.unwrap_or_else(|| "bearer".to_string()),
            expires_at,
            user: self.user,
        }
    }
}

/// Signup answers with a session, or with the bare user when email
/// confirmation is required.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    PendingConfirmation(AuthenticatedUser),
}

/// Error bodies come in two generations of the API.
#[derive(Debug, Default, Deserialize)]
struct GoTrueErrorBody {
    error: Option<String>,
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

impl GoTrueErrorBody {
    fn into_message(self) -> Option<String> {
        self.error_description
            .or(self.msg)
            .or(self.message)
            .or(self.error)
            .filter(|m| !m.trim().is_empty())
    }
}

/// Check response status and return an error if not successful.
async fn check_response(
    response: reqwest::Response,
    endpoint: Endpoint,
) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<GoTrueErrorBody>(&body)
        .ok()
        .and_then(GoTrueErrorBody::into_message)
        .unwrap_or_else(|| format!("HTTP {}", status));

    if status == 429 {
        tracing::warn!("Identity provider rate limit hit (429)");
        return Err(AuthError::Backend { status, message });
    }

    match (endpoint, status) {
        (Endpoint::Credentials, 400 | 401 | 403 | 422) => Err(AuthError::Credential(message)),
        _ => Err(AuthError::Backend { status, message }),
    }
}

/// Check response and parse JSON body.
async fn check_response_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
    endpoint: Endpoint,
) -> Result<T> {
    let response = check_response(response, endpoint).await?;
    response
        .json()
        .await
        .map_err(|e| AuthError::Internal(anyhow::anyhow!("JSON parse error: {}", e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// SupabaseAuth - identity provider with persistence and change notifications
// ─────────────────────────────────────────────────────────────────────────────

/// Identity provider backed by the hosted GoTrue service.
///
/// This service encapsulates:
/// - The live session, shared with the record store through a [`SessionCell`]
/// - Persistence of the session through a [`SessionStorage`]
/// - Refresh when the access token is within 5 minutes of expiry
/// - A lock so concurrent callers trigger at most one refresh
/// - Broadcasting of auth change events
///
/// A refresh result is only kept if the session it refreshed is still the
/// live one when the response arrives. A sign-out or a new sign-in that lands
/// while the refresh is in flight wins.
pub struct SupabaseAuth {
    client: GoTrueClient,
    storage: Arc<dyn SessionStorage>,
    current: SessionCell,
    events: AuthBroadcaster,
    refresh_lock: Mutex<()>,
    /// Serializes writes to the cell and storage.
    write_lock: Mutex<()>,
}

impl SupabaseAuth {
    pub fn new(client: GoTrueClient, storage: Arc<dyn SessionStorage>, current: SessionCell) -> Self {
        Self {
            client,
            storage,
            current,
            events: AuthBroadcaster::default(),
            refresh_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn client(&self) -> &GoTrueClient {
        &self.client
    }

    /// Session slot shared with other adapters.
    pub fn session_cell(&self) -> SessionCell {
        self.current.clone()
    }

    async fn store(&self, session: &Session) {
        let _write = self.write_lock.lock().await;
        self.persist(session).await;
    }

    async fn forget(&self) {
        let _write = self.write_lock.lock().await;
        self.clear().await;
    }

    /// Replace the session only if `expected` is still the live access token.
    async fn store_if_current(&self, expected: &str, session: &Session) -> bool {
        let _write = self.write_lock.lock().await;
        if self.current.access_token().await.as_deref() != Some(expected) {
            return false;
        }
        self.persist(session).await;
        true
    }

    /// Clear the session only if `expected` is still the live access token.
    async fn forget_if_current(&self, expected: &str) -> bool {
        let _write = self.write_lock.lock().await;
        if self.current.access_token().await.as_deref() != Some(expected) {
            return false;
        }
        self.clear().await;
        true
    }

    async fn persist(&self, session: &Session) {
        self.current.set(Some(session.clone())).await;
        if let Err(e) = self.storage.save(session).await {
            // The session still works for this run; only restore-on-launch is lost.
            tracing::warn!(error = %e, "Failed to persist session");
        }
    }

    async fn clear(&self) {
        self.current.set(None).await;
        if let Err(e) = self.storage.clear().await {
            tracing::warn!(error = %e, "Failed to clear persisted session");
        }
    }

    /// Periodically refresh the session before it expires.
    ///
    /// The task stops on its own once the provider is dropped.
    pub fn spawn_auto_refresh(self: &Arc<Self>, period: std::time::Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(auth) = weak.upgrade() else {
                    break;
                };
                let due = auth.current.get().await.is_some_and(|s| {
                    s.expires_within(Duration::seconds(TOKEN_REFRESH_MARGIN_SECS), Utc::now())
                });
                if !due {
                    continue;
                }
                if let Err(e) = auth.refresh_session().await {
                    tracing::warn!(error = %e, "Background token refresh failed");
                }
            }
            tracing::debug!("Auto refresh stopped");
        })
    }
}

#[async_trait]
impl IdentityProvider for SupabaseAuth {
    async fn get_session(&self) -> Result<Option<Session>> {
        let session = match self.current.get().await {
            Some(session) => session,
            None => match self.storage.load().await? {
                Some(session) => {
                    let _write = self.write_lock.lock().await;
                    self.current.set(Some(session.clone())).await;
                    session
                }
                None => return Ok(None),
            },
        };

        if session.expires_within(Duration::seconds(TOKEN_REFRESH_MARGIN_SECS), Utc::now()) {
            tracing::debug!(user_id = %session.user.id, "Restored session is expiring, refreshing");
            return self.refresh_session().await;
        }
        Ok(Some(session))
    }

    fn subscribe(&self) -> AuthSubscription {
        self.events.subscribe()
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session> {
        let session = self.client.sign_in_with_password(email, password).await?;
        self.store(&session).await;
        tracing::info!(user_id = %session.user.id, "Signed in");
        self.events
            .emit(AuthChange::established(AuthEvent::SignedIn, session.clone()));
        Ok(session)
    }

    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Map<String, Value>,
    ) -> Result<SignUpOutcome> {
        let outcome = self.client.sign_up(email, password, &metadata).await?;
        match &outcome.session {
            Some(session) => {
                self.store(session).await;
                tracing::info!(user_id = %outcome.user.id, "Signed up");
                self.events
                    .emit(AuthChange::established(AuthEvent::SignedUp, session.clone()));
            }
            None => {
                tracing::info!(user_id = %outcome.user.id, "Signed up, awaiting email confirmation");
            }
        }
        Ok(outcome)
    }

    async fn sign_out(&self) -> Result<()> {
        let previous = self.current.get().await;
        self.forget().await;
        self.events.emit(AuthChange::cleared(AuthEvent::SignedOut));

        match previous {
            Some(session) => self.client.sign_out(&session.access_token).await,
            None => Ok(()),
        }
    }

    async fn refresh_session(&self) -> Result<Option<Session>> {
        let stale = match self.current.get().await {
            Some(session) => session,
            None => return Ok(None),
        };

        let _guard = self.refresh_lock.lock().await;

        // Another task may have refreshed while we were waiting.
        let Some(current) = self.current.get().await else {
            return Ok(None);
        };
        if current.access_token != stale.access_token {
            return Ok(Some(current));
        }

        match self.client.refresh(&current.refresh_token).await {
            Ok(session) => {
                if !self.store_if_current(&current.access_token, &session).await {
                    tracing::debug!(user_id = %current.user.id, "Session changed during refresh, dropping result");
                    return Ok(self.current.get().await);
                }
                tracing::debug!(user_id = %session.user.id, "Token refreshed");
                self.events
                    .emit(AuthChange::established(AuthEvent::TokenRefreshed, session.clone()));
                Ok(Some(session))
            }
            Err(e) if e.is_rejection() => {
                if !self.forget_if_current(&current.access_token).await {
                    return Ok(self.current.get().await);
                }
                tracing::warn!(user_id = %current.user.id, error = %e, "Refresh token rejected, clearing session");
                self.events.emit(AuthChange::cleared(AuthEvent::TokenInvalid));
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_prefers_description() {
        let body: GoTrueErrorBody = serde_json::from_str(
            r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#,
        )
        .unwrap();
        assert_eq!(body.into_message().as_deref(), Some("Invalid login credentials"));

        let body: GoTrueErrorBody =
            serde_json::from_str(r#"{"code":422,"msg":"User already registered"}"#).unwrap();
        assert_eq!(body.into_message().as_deref(), Some("User already registered"));
    }

    #[test]
    fn signup_without_session_is_pending_confirmation() {
        let parsed: SignUpResponse = serde_json::from_value(serde_json::json!({
            "id": "u1",
            "email": "sam@dorm.edu",
            "user_metadata": {},
            "app_metadata": {},
            "created_at": "2025-09-01T12:00:00.123456Z"
        }))
        .unwrap();
        assert!(matches!(parsed, SignUpResponse::PendingConfirmation(_)));
    }

    #[test]
    fn token_response_uses_expires_at() {
        let token: TokenResponse = serde_json::from_value(serde_json::json!({
            "access_token": "a",
            "refresh_token": "r",
            "token_type": "bearer",
            "expires_in": 3600,
            "expires_at": 1_900_000_000,
            "user": { "id": "u1", "email": "sam@dorm.edu" }
        }))
        .unwrap();
        let session = token.into_session();
        assert_eq!(session.expires_at.timestamp(), 1_900_000_000);
        assert_eq!(session.user.id, "u1");
    }
}
