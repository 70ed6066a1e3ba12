// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The catch-all route: every proxied request, regardless of method or
//! path, lands here and is dispatched by the [`Orchestrator`](crate::orchestrator::Orchestrator).

use axum::{
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::Response,
};

use crate::types::AppState;

pub async fn handle(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    state.orchestrator.serve(method, uri, headers).await
}
