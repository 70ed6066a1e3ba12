// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! A caching reverse proxy in front of a model-hub content service: a
//! metadata index, a content-addressed local blob cache, and a best-effort
//! remote mirror sit in front of the upstream hub so that repeated requests
//! for the same file content are served without re-fetching it.

pub mod config;
pub mod errors;
pub mod local_cache;
pub mod metacache;
pub mod orchestrator;
pub mod remote_cache;
pub mod routes;
pub mod server;
pub mod tee;
pub mod types;
pub mod upstream;
