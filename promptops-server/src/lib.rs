// Copyright 2025 PromptOps Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

pub mod api;
pub mod broadcast;
pub mod config;
pub mod registry;
pub mod sweeper;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use api::{
    abort_test, delete_test, get_test, health_check, list_tests, register_test,
    stream_test_status, update_test, AppState,
};
use broadcast::StatusBroadcaster;
use config::ServerConfig;
use registry::{RegistryConfig, TestRegistry};

/// Build the HTTP router over the given state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/projects/:project_id/tests",
            post(register_test),
        )
        .route(
            "/api/v1/projects/:project_id/tests/:test_id",
            get(get_test).delete(delete_test),
        )
        .route(
            "/api/v1/projects/:project_id/tests/:test_id/status",
            post(update_test),
        )
        .route(
            "/api/v1/projects/:project_id/tests/:test_id/abort",
            post(abort_test),
        )
        .route(
            "/api/v1/projects/:project_id/tests/:test_id/events",
            get(stream_test_status),
        )
        .route("/api/v1/tests", get(list_tests))
        .route("/api/v1/health", get(health_check))
        .with_state(state)
}

/// Construct the registry and its broadcaster from config.
pub fn build_registry(config: &ServerConfig) -> TestRegistry {
    let broadcaster = StatusBroadcaster::new(config.tests.broadcast_capacity);
    TestRegistry::new(
        RegistryConfig {
            max_runtime: config.tests.max_runtime(),
            retention: config.tests.retention(),
        },
        broadcaster,
    )
}

pub async fn run_server(config: ServerConfig) -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "promptops_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting PromptOps test-tracking server");
    tracing::info!("Configuration: {:#?}", config);

    config.validate()?;

    let registry = build_registry(&config);

    // Start the cleanup sweeper for the process lifetime.
    let _sweeper = sweeper::spawn_sweeper(registry.clone(), config.tests.sweep_interval());
    tracing::info!(
        period_secs = config.tests.sweep_interval_secs,
        "cleanup sweeper started"
    );

    let state = AppState { registry };
    let mut app = build_router(state).layer(TraceLayer::new_for_http());

    if config.server.enable_cors {
        app = app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    let addr = config.socket_addr()?;
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
