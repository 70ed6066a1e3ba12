// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;

use crate::types::AppState;

/// Represents a health status response of the proxy server.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Version of the binary.
    pub version: String,
    /// The total uptime of the proxy server.
    pub uptime_secs: u64,
}

/// Handles the health check request for the proxy server.
///
/// Unlike the request path, this endpoint never touches the remote store or
/// upstream hub: it is meant to answer quickly enough for a liveness probe.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    };

    Json(response)
}
