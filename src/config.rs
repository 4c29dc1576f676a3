// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Channels every member joins once onboarding completes.
pub const DEFAULT_CHANNELS: [&str; 3] = ["General", "Announcements", "Events"];

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the hosted backend (e.g. https://xyz.supabase.co)
    pub supabase_url: String,
    /// Public anon key sent as `apikey` on every request
    pub supabase_anon_key: String,
    /// Where the persisted session is kept between launches
    pub session_store_path: PathBuf,
    /// Per-request HTTP timeout
    pub http_timeout: Duration,
    /// How often the background refresher checks token expiry
    pub token_refresh_interval: Duration,
    /// Channel names joined after onboarding
    pub default_channels: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let supabase_url = env::var("SUPABASE_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .map_err(|_| ConfigError::Missing("SUPABASE_URL"))?;
        if !supabase_url.starts_with("http://") && !supabase_url.starts_with("https://") {
            return Err(ConfigError::Invalid("SUPABASE_URL", supabase_url));
        }

        Ok(Self {
            supabase_url,
            supabase_anon_key: env::var("SUPABASE_ANON_KEY")
                .map(|v| v.trim().to_string())
                .map_err(|_| ConfigError::Missing("SUPABASE_ANON_KEY"))?,
            session_store_path: env::var("SESSION_STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".dormx/session.json")),
            http_timeout: Duration::from_secs(parse_secs("HTTP_TIMEOUT_SECS", 10)?),
            token_refresh_interval: Duration::from_secs(parse_secs(
                "TOKEN_REFRESH_INTERVAL_SECS",
                60,
            )?),
            default_channels: env::var("DEFAULT_CHANNELS")
                .map(|v| parse_channel_list(&v))
                .unwrap_or_else(|_| default_channel_names()),
        })
    }

    /// Config for tests; points at a local backend that is never contacted.
    pub fn test_default() -> Self {
        Self {
            supabase_url: "http://127.0.0.1:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            session_store_path: PathBuf::from("target/test-session.json"),
            http_timeout: Duration::from_secs(5),
            token_refresh_interval: Duration::from_secs(60),
            default_channels: default_channel_names(),
        }
    }
}

pub fn default_channel_names() -> Vec<String> {
    DEFAULT_CHANNELS.iter().map(|s| s.to_string()).collect()
}

fn parse_channel_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_secs(var: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(var) {
        Ok(v) => match v.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(ConfigError::Invalid(var, v)),
            Ok(secs) => Ok(secs),
        },
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}
