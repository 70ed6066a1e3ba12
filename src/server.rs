// Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Helper wrappers for building and starting the proxy's HTTP server.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use reqwest::{redirect::Policy, Client};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    local_cache::FileLocalCache,
    metacache::TtlMetaDataCache,
    orchestrator::Orchestrator,
    remote_cache::ObjectStoreMirror,
    routes::{health, proxy},
    types::AppState,
    upstream::UpstreamProbe,
};

const UPSTREAM_TIMEOUT_SECS: u64 = 5;

/// A wrapper which builds the components needed for the proxy server and
/// provides a simple way to start it.
pub struct Server {
    router: Router,
    server_address: SocketAddr,
    token: CancellationToken,
}

impl Server {
    /// Builds every tier of the cache (metadata index, local blob cache,
    /// remote mirror) plus the upstream probe, wires them into an
    /// [`Orchestrator`], and constructs the [`Router`].
    pub async fn new(config: Config, token: CancellationToken) -> Result<Self> {
        let server_address: SocketAddr = config
            .proxy
            .addr
            .parse()
            .with_context(|| format!("invalid proxy.addr {:?}", config.proxy.addr))?;

        let meta_cache = Arc::new(TtlMetaDataCache::new(&config.meta_cache));
        let local_cache = Arc::new(
            FileLocalCache::new(config.local_cache.cache_dir.clone())
                .await
                .context("failed to initialize local blob cache")?,
        );
        let remote_cache = Arc::new(
            ObjectStoreMirror::new(&config.remote_cache)
                .context("failed to initialize remote object store mirror")?,
        );

        let upstream_base = derive_upstream_base(&config.proxy.targets);
        let upstream = UpstreamProbe::new(upstream_base);

        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
            .redirect(Policy::none())
            .build()
            .context("failed to build upstream http client")?;

        let allowed_hosts = derive_allowed_hosts(&config.proxy.targets)?;

        let orchestrator = Arc::new(Orchestrator {
            meta_cache,
            local_cache,
            remote_cache,
            upstream,
            http_client,
            proxy_url: config.proxy.proxy_url.clone(),
            allowed_hosts,
        });

        let state = AppState {
            orchestrator,
            started_at: Instant::now(),
        };

        let router = Router::new()
            .route("/healthz", get(health::health))
            .fallback(proxy::handle)
            .with_state(state);

        Ok(Self {
            router,
            token,
            server_address,
        })
    }

    /// Start the server, this method is blocking.
    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.server_address)
            .await
            .context("failed to bind to socket")?;

        tracing::info!("listening on: {}", self.server_address);

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                self.token.cancelled().await;
                tracing::info!("shutdown signal received.");
            })
            .await
            .inspect_err(|e| tracing::error!("server encountered an error: {e}"))
            .map_err(Into::into)
    }
}

/// Picks the first configured target as the upstream hub probed for
/// metadata, falling back to the public hub if none is configured.
/// `targets` entries are already full scheme-prefixed URLs, so this is used
/// as-is rather than having a scheme re-prepended onto it.
fn derive_upstream_base(targets: &[String]) -> String {
    targets
        .first()
        .cloned()
        .unwrap_or_else(|| "https://huggingface.co".to_string())
}

/// Extracts the bare host from each configured target, since
/// `Orchestrator::serve` matches incoming requests against the bare host it
/// parses out of the request line, not against a full URL.
fn derive_allowed_hosts(targets: &[String]) -> Result<Vec<String>> {
    targets
        .iter()
        .map(|target| {
            url::Url::parse(target)
                .ok()
                .and_then(|url| url.host_str().map(str::to_string))
                .with_context(|| format!("invalid proxy.targets entry {target:?}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_bare_hosts_from_full_target_urls() {
        let targets = vec![
            "https://huggingface.co".to_string(),
            "https://hf-mirror.com".to_string(),
        ];
        assert_eq!(
            derive_allowed_hosts(&targets).unwrap(),
            vec!["huggingface.co".to_string(), "hf-mirror.com".to_string()]
        );
    }

    #[test]
    fn rejects_a_target_without_a_parseable_host() {
        let targets = vec!["not a url".to_string()];
        assert!(derive_allowed_hosts(&targets).is_err());
    }

    #[test]
    fn upstream_base_keeps_the_first_target_as_is() {
        assert_eq!(
            derive_upstream_base(&["https://huggingface.co".to_string()]),
            "https://huggingface.co"
        );
    }

    #[test]
    fn upstream_base_falls_back_to_the_public_hub() {
        assert_eq!(derive_upstream_base(&[]), "https://huggingface.co");
    }
}
