// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module contains all routes supported by the proxy server.

pub mod health;
pub mod proxy;
