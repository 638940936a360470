//! HTTP server exposing the latest features to display processes.
//!
//! This module provides an HTTP server that:
//! - Serves the latest band powers via GET /data
//! - Serves per-channel averages of the latest raw window via GET /raw
//! - Never blocks the poller: handlers read a copy of the latest-value slot
//!
//! # Architecture
//!
//! ```text
//! Board ──→ Poller ──→ LatestSlot ──→ GET /data ──→ display process
//!                          │
//!                          └────────→ GET /raw
//! ```

use crate::poller::{LatestSlot, LatestValue};
use crate::remote::FeatureEnvelope;
use axum::{extract::State, http::Method, routing::get, Json, Router};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub host: IpAddr,
    /// Port to bind to (0 for random)
    pub port: u16,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(host: IpAddr, port: u16) -> Self {
        Self { host, port }
    }

    /// Bind on localhost only.
    pub fn local(port: u16) -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5000)
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Envelope for the band-power endpoint.
pub fn data_envelope(latest: &LatestValue) -> FeatureEnvelope {
    match latest {
        LatestValue::Record { record, .. } => FeatureEnvelope::success(record.bands.as_array().to_vec()),
        LatestValue::NoData => FeatureEnvelope::no_data(),
        LatestValue::Error(message) => FeatureEnvelope::error(message.clone()),
    }
}

/// Envelope for the raw per-channel endpoint.
pub fn raw_envelope(latest: &LatestValue) -> FeatureEnvelope {
    match latest {
        LatestValue::Record { channel_means, .. } if !channel_means.is_empty() => {
            FeatureEnvelope::success(channel_means.clone())
        }
        LatestValue::Error(message) => FeatureEnvelope::error(message.clone()),
        _ => FeatureEnvelope::no_data(),
    }
}

/// GET /
async fn index() -> &'static str {
    "NeuroFocus feature server. Endpoints: /data, /raw, /health"
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /data
async fn data(State(latest): State<LatestSlot>) -> Json<FeatureEnvelope> {
    Json(data_envelope(&latest.snapshot()))
}

/// GET /raw
async fn raw(State(latest): State<LatestSlot>) -> Json<FeatureEnvelope> {
    Json(raw_envelope(&latest.snapshot()))
}

/// Run the HTTP server
///
/// Must be called from within a tokio runtime. Dropping or sending on the
/// returned sender shuts the server down gracefully.
pub async fn run(
    config: ServerConfig,
    latest: LatestSlot,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/data", get(data))
        .route("/raw", get(raw))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET])
                .allow_headers(Any),
        )
        .with_state(latest);

    let addr = SocketAddr::new(config.host, config.port);
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Feature server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
