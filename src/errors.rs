// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Error types the proxy sends back to the client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Errors arising while serving a proxied request. Distinct from a plain
/// upstream 4xx/5xx, which is relayed to the client as-is rather than
/// wrapped here.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("malformed proxied url: {0}")]
    BadTarget(String),
    #[error("upstream request failed: {0}")]
    Upstream(String),
    #[error("local cache error: {0}")]
    Cache(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match self {
            ProxyError::BadTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse {
            error_code: status.as_u16().to_string(),
            error_message: self.to_string(),
        });

        (status, body).into_response()
    }
}

/// Describes the response body of an unsuccessful HTTP request.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct ErrorResponse {
    error_code: String,
    error_message: String,
}
