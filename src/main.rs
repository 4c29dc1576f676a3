// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! DormX session probe
//!
//! Restores the persisted session against the configured backend, logs
//! which screen the app would open on, and exits.

use dormx_session::{
    config::Config,
    db::PostgrestDb,
    services::{
        FileSessionStorage, GoTrueClient, SessionCell, SessionController, SupabaseAuth,
    },
    telemetry, ControllerOptions,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_logging();

    let config = Config::from_env()?;
    tracing::info!(backend = %config.supabase_url, "Starting DormX session probe");

    let client = GoTrueClient::new(&config)?;
    match client.health().await {
        Ok(()) => tracing::info!("Identity service reachable"),
        Err(e) => tracing::warn!(error = %e, "Identity service health check failed"),
    }

    let cell = SessionCell::new();
    let storage = Arc::new(FileSessionStorage::new(&config.session_store_path));
    tracing::info!(path = %config.session_store_path.display(), "Session storage ready");

    let auth = Arc::new(SupabaseAuth::new(client, storage, cell.clone()));
    let refresher = auth.spawn_auto_refresh(config.token_refresh_interval);
    let db = Arc::new(PostgrestDb::new(&config, cell)?);

    let controller = SessionController::start(auth, db, ControllerOptions::from(&config));
    let state = controller.wait_until_initialized().await;

    tracing::info!(
        phase = ?state.phase(),
        needs_onboarding = state.needs_onboarding,
        "Session bootstrap complete"
    );
    if let Some(info) = state.user_info() {
        tracing::info!(
            user_id = %info.id,
            name = %info.name,
            dorm = info.dorm_name.as_deref().unwrap_or("-"),
            "Signed in"
        );
    }

    controller.shutdown().await;
    refresher.abort();
    Ok(())
}
