// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Types and useful conversions shared across the server.

use std::time::Instant;

use crate::orchestrator::SharedOrchestrator;

/// Server-wide state handed to every route via [`State`](axum::extract::State).
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: SharedOrchestrator,
    pub started_at: Instant,
}
