//! Matchmaking queue and signaling relay for anonymous 1:1 WebRTC sessions.
//!
//! Clients connect to `/ws`, ask to enter the queue and are paired first in,
//! first out. The two members of a match then exchange their offer, answer,
//! ICE candidates and device-change notices through the relay, which only
//! ever forwards a frame to the other member of the named match.

pub mod broker;
pub mod config;
pub mod lobby;
pub mod matches;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod telemetry;
pub mod websocket;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::broker::Broker;
use crate::config::ServerConfig;

pub struct AppState {
    pub broker: Broker,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(broker: Broker, metrics: Option<PrometheusHandle>) -> Self {
        Self { broker, metrics }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(websocket::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serves until `shutdown` resolves, then waits out the configured grace period.
pub async fn run<F>(
    config: ServerConfig,
    listener: TcpListener,
    metrics: Option<PrometheusHandle>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let broker = Broker::new();
    let reaper = broker.spawn_reaper(config.reap_interval, config.idle_timeout);
    let state = Arc::new(AppState::new(broker, metrics));

    info!(
        listen_addr = %listener.local_addr().context("listener has no local address")?,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "tandem-server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    reaper.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.broker.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
