// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! PostgREST client for the hosted relational store.
//!
//! Provides typed operations for:
//! - Profiles (fetch by id, upsert keyed by id)
//! - Channels (lookup by name)
//! - Chat memberships (list for a user, bulk insert)

use crate::config::Config;
use crate::db::{tables, RecordStore};
use crate::error::{AuthError, Result};
use crate::models::{Channel, ChannelMembership, Profile, ProfileUpsert};
use crate::services::SessionCell;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Error body returned by PostgREST.
#[derive(Debug, Deserialize)]
struct PostgrestErrorBody {
    message: Option<String>,
    code: Option<String>,
    details: Option<String>,
}

/// Record store backed by the backend's PostgREST endpoint.
#[derive(Clone)]
pub struct PostgrestDb {
    http: reqwest::Client,
    rest_url: String,
    anon_key: String,
    session: SessionCell,
}

impl PostgrestDb {
    /// Create a client for `{supabase_url}/rest/v1`.
    ///
    /// Requests carry the signed-in user's access token from `session`, or the
    /// anon key when nobody is signed in.
    pub fn new(config: &Config, session: SessionCell) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("HTTP client build failed: {}", e)))?;

        Ok(Self {
            http,
            rest_url: format!("{}/rest/v1", config.supabase_url),
            anon_key: config.supabase_anon_key.clone(),
            session,
        })
    }

    fn table_url(&self, table: &str, filters: &[(&str, String)]) -> String {
        let query = filters
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        if query.is_empty() {
            format!("{}/{}", self.rest_url, table)
        } else {
            format!("{}/{}?{}", self.rest_url, table, query)
        }
    }

    async fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let token = self
            .session
            .access_token()
            .await
            .unwrap_or_else(|| self.anon_key.clone());
        builder.header("apikey", &self.anon_key).bearer_auth(token)
    }

    async fn get_rows<T: DeserializeOwned>(&self, url: &str) -> Result<Vec<T>> {
        let response = self.authorized(self.http.get(url)).await.send().await?;
        check_response_json(response).await
    }

    async fn post_rows<B: serde::Serialize + ?Sized>(
        &self,
        url: &str,
        prefer: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let response = self
            .authorized(self.http.post(url))
            .await
            .header("Prefer", prefer)
            .json(body)
            .send()
            .await?;
        check_response(response).await
    }
}

/// `in.("a","b")` list filter with PostgREST quoting.
fn in_list(values: &[String]) -> String {
    let quoted = values
        .iter()
        .map(|v| format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    format!("in.({})", quoted)
}

/// Check response status and return an error if not successful.
async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<PostgrestErrorBody>(&body) {
        Ok(parsed) => {
            let mut message = parsed.message.unwrap_or_else(|| "request rejected".to_string());
            if let Some(details) = parsed.details.filter(|d| !d.is_empty()) {
                message = format!("{} ({})", message, details);
            }
            if let Some(code) = parsed.code {
                message = format!("[{}] {}", code, message);
            }
            message
        }
        Err(_) if body.is_empty() => format!("HTTP {}", status),
        Err(_) => body,
    };

    tracing::warn!(status, error = %message, "Record store request failed");
    Err(AuthError::Backend { status, message })
}

/// Check response and parse JSON body.
async fn check_response_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let response = check_response(response).await?;
    response
        .json()
        .await
        .map_err(|e| AuthError::Internal(anyhow::anyhow!("JSON parse error: {}", e)))
}

#[async_trait]
impl RecordStore for PostgrestDb {
    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        let url = self.table_url(
            tables::PROFILES,
            &[("select", "*".to_string()), ("id", format!("eq.{}", user_id))],
        );
        let rows: Vec<Profile> = self.get_rows(&url).await?;
        Ok(rows.into_iter().next())
    }

    async fn upsert_profile(&self, row: &ProfileUpsert) -> Result<Profile> {
        let url = self.table_url(tables::PROFILES, &[("on_conflict", "id".to_string())]);
        let response = self
            .post_rows(
                &url,
                "resolution=merge-duplicates,return=representation",
                std::slice::from_ref(row),
            )
            .await?;
        let rows: Vec<Profile> = response
            .json()
            .await
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("JSON parse error: {}", e)))?;

        rows.into_iter().next().ok_or_else(|| {
            AuthError::Internal(anyhow::anyhow!("Upsert returned no row for {}", row.id))
        })
    }

    async fn insert_profile_if_absent(&self, row: &ProfileUpsert) -> Result<Option<Profile>> {
        let url = self.table_url(tables::PROFILES, &[("on_conflict", "id".to_string())]);
        let response = self
            .post_rows(
                &url,
                "resolution=ignore-duplicates,return=representation",
                std::slice::from_ref(row),
            )
            .await?;
        // An ignored duplicate comes back as an empty array.
        let rows: Vec<Profile> = response
            .json()
            .await
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("JSON parse error: {}", e)))?;
        Ok(rows.into_iter().next())
    }

    async fn find_channels(&self, names: &[String]) -> Result<Vec<Channel>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.table_url(
            tables::CHANNELS,
            &[("select", "id,name".to_string()), ("name", in_list(names))],
        );
        self.get_rows(&url).await
    }

    async fn channel_memberships(&self, user_id: &str) -> Result<Vec<ChannelMembership>> {
        let url = self.table_url(
            tables::CHAT_MEMBERS,
            &[
                ("select", "user_id,channel_id,joined_at".to_string()),
                ("user_id", format!("eq.{}", user_id)),
            ],
        );
        self.get_rows(&url).await
    }

    async fn add_memberships(&self, rows: &[ChannelMembership]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let url = self.table_url(tables::CHAT_MEMBERS, &[]);
        self.post_rows(&url, "resolution=ignore-duplicates,return=minimal", rows)
            .await?;
        Ok(())
    }
}
