//! HTTP handlers

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::server::AppState;

/// Relay status
#[derive(Debug, Serialize)]
pub struct RelayStatus {
    pub name: &'static str,
    pub status: &'static str,
    pub connections: usize,
    /// Connections per occupied channel
    pub channels: BTreeMap<u8, usize>,
    pub uptime_seconds: u64,
    pub started_at: DateTime<Utc>,
}

/// Get relay status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<RelayStatus> {
    Json(RelayStatus {
        name: env!("CARGO_PKG_NAME"),
        status: "running",
        connections: state.relay.connection_count(),
        channels: state.relay.channel_counts(),
        uptime_seconds: state.relay.uptime_seconds(),
        started_at: state.relay.started_at(),
    })
}

/// Liveness probe
pub async fn health() -> &'static str {
    "ok"
}
