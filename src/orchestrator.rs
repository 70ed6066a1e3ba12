//! The proxy's core request-routing logic: per-request tier selection
//! across the metadata index, local blob cache, remote mirror, and upstream,
//! plus the URL rewriting that keeps content identity attached to a blob
//! across redirects.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use reqwest::Client;
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::warn;

use crate::{
    errors::ProxyError,
    local_cache::{LocalBlobCache, SharedLocalBlobCache},
    metacache::{FileMetadata, MetaDataCache, SharedMetaDataCache},
    remote_cache::{RemoteCache, SharedRemoteCache},
    tee::tee_stream,
    upstream::UpstreamProbe,
};

const ETAG_QUERY_PARAM: &str = "x-etag";
const ETAG_HEADER: &str = "x-etag";

/// Everything a request needs to be served: the three caches and the
/// upstream probe, plus the set of allowed upstream hosts and this proxy's
/// own externally-reachable base URL (used to rewrite `Location` headers so
/// future requests route back through us).
pub struct Orchestrator {
    pub meta_cache: SharedMetaDataCache,
    pub local_cache: SharedLocalBlobCache,
    pub remote_cache: SharedRemoteCache,
    pub upstream: UpstreamProbe,
    pub http_client: Client,
    pub proxy_url: String,
    pub allowed_hosts: Vec<String>,
}

impl Orchestrator {
    /// The single entry point mirroring the reference's `ServeHTTP`: strips
    /// the leading slash, recovers the original request line as a full URL,
    /// and dispatches on method.
    pub async fn serve(&self, method: Method, uri: Uri, headers: HeaderMap) -> Response {
        let raw = uri.path().trim_start_matches('/');
        let query = uri.query().unwrap_or_default();
        let origin_url = if query.is_empty() {
            raw.to_string()
        } else {
            format!("{raw}?{query}")
        };

        let Some(mut target) = parse_target_url(&origin_url) else {
            return ProxyError::BadTarget(origin_url).into_response();
        };

        let host = target.host.clone();
        if !self.allowed_hosts.iter().any(|h| h == &host) {
            // Matches the reference's quirk verbatim: a forbidden host is
            // reported with HTTP 200, not 403. Preserved intentionally.
            return (StatusCode::OK, format!("403: Host forbidden {origin_url}")).into_response();
        }

        let etag_header = extract_etag(&target, &headers);
        // the synthetic x-etag query param is this proxy's own bookkeeping;
        // it is consumed above and must never reach the real upstream/CDN.
        target.full = strip_query_param(&target.full, ETAG_QUERY_PARAM);

        match method {
            Method::HEAD => self.serve_head(&target, etag_header).await,
            Method::GET => self.serve_get(&target, etag_header).await,
            _ => self.proxy_passthrough(&target, method, headers).await,
        }
    }

    async fn serve_head(&self, target: &TargetUrl, _etag_header: Option<String>) -> Response {
        if let Some(hg) = parse_hg_uri(&target.full) {
            if let Some(meta) = self.meta_cache.search_metadata(&hg.project, &hg.file, &hg.revision) {
                if meta.is_cacheable() {
                    return self.synthesize_head_response(&meta);
                }
            }
        }

        let upstream_response = match self
            .http_client
            .head(&target.full)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return ProxyError::Upstream(err.to_string()).into_response(),
        };

        let mut meta = FileMetadata::default();
        if let Some(hg) = parse_hg_uri(&target.full) {
            meta = metadata_from_response_headers(upstream_response.headers(), &hg.revision);
            if meta.is_cacheable() {
                self.meta_cache.append_metadata(&hg.project, &hg.file, meta.clone());
            }
        }

        let mut builder = Response::builder().status(upstream_response.status());
        for (name, value) in upstream_response.headers() {
            if name == reqwest::header::LOCATION {
                if let Some(rewritten) = self.modify_file_location(&meta) {
                    builder = builder.header("location", rewritten);
                    continue;
                }
            }
            builder = builder.header(name, value);
        }
        builder.body(Body::empty()).unwrap_or_else(|_| {
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to build response").into_response()
        })
    }

    fn synthesize_head_response(&self, meta: &FileMetadata) -> Response {
        let mut builder = Response::builder().status(StatusCode::OK);
        builder = builder
            .header("x-linked-size", meta.size.clone())
            .header("x-repo-commit", meta.commit_hash.clone())
            .header("x-linked-etag", format!("\"{}\"", meta.etag))
            .header("accept-ranges", "bytes");
        if let Some(location) = self.modify_file_location(meta) {
            builder = builder.header("location", location);
        }
        builder
            .body(Body::empty())
            .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "").into_response())
    }

    async fn serve_get(&self, target: &TargetUrl, etag_header: Option<String>) -> Response {
        let etag = match self.resolve_etag(target, etag_header).await {
            Some(etag) => etag,
            None => return self.proxy_and_cache(target).await,
        };

        if self.local_cache.has_file(&etag) {
            let path = self.local_cache.file_path(&etag);
            let service = ServeFile::new(path);
            let request = axum::http::Request::builder()
                .method(Method::GET)
                .uri("/")
                .body(Body::empty())
                .unwrap();
            return match service.oneshot(request).await {
                Ok(response) => response.into_response(),
                Err(err) => {
                    warn!(%etag, error = ?err, "failed to serve cached blob");
                    (StatusCode::INTERNAL_SERVER_ERROR, "failed to serve cached blob").into_response()
                }
            };
        }

        if let Some(stream) = self.remote_cache.fetch_file(&etag).await {
            let body = Body::from_stream(stream);
            return Response::builder()
                .status(StatusCode::OK)
                .header("x-linked-etag", format!("\"{etag}\""))
                .body(body)
                .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "").into_response());
        }

        self.proxy_and_cache(target).await
    }

    /// Resolves the content-identity etag for a GET, trying, in order: the
    /// `x-etag` query/header carried from a prior rewrite, a metadata-index
    /// hit keyed off an `hf.co/.../resolve/...` URL, and finally the CDN
    /// URL's own etag-bearing path segment.
    async fn resolve_etag(&self, target: &TargetUrl, etag_header: Option<String>) -> Option<String> {
        if let Some(etag) = etag_header {
            if !etag.is_empty() {
                return Some(etag);
            }
        }

        if let Some(hg) = parse_hg_uri(&target.full) {
            if let Some(meta) = self.meta_cache.search_metadata(&hg.project, &hg.file, &hg.revision) {
                if meta.is_cacheable() {
                    return Some(meta.etag);
                }
            }

            let probed = self.upstream.file_meta(&hg.project, &hg.file, &hg.revision).await;
            if probed.is_cacheable() {
                self.meta_cache.append_metadata(&hg.project, &hg.file, probed.clone());
                return Some(probed.etag);
            }
        }

        etag_from_cdn_uri(&target.full)
    }

    async fn proxy_and_cache(&self, target: &TargetUrl) -> Response {
        let upstream_response = match self.http_client.get(&target.full).send().await {
            Ok(response) => response,
            Err(err) => return ProxyError::Upstream(err.to_string()).into_response(),
        };

        let status = upstream_response.status();

        if matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND) {
            let mut builder = Response::builder().status(status);
            for (name, value) in upstream_response.headers() {
                if name == reqwest::header::LOCATION {
                    if let Some(location) = value.to_str().ok().map(|l| self.rewrite_redirect_location(l)) {
                        builder = builder.header("location", location);
                        continue;
                    }
                }
                builder = builder.header(name, value);
            }
            return builder
                .body(Body::empty())
                .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "").into_response());
        }

        let content_length = upstream_response.content_length();
        let has_range = upstream_response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .is_some();
        let etag = upstream_response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        let headers = upstream_response.headers().clone();
        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }

        let should_cache = status == StatusCode::OK
            && !has_range
            && content_length.is_some_and(|len| len > 0)
            && etag.as_ref().is_some_and(|e| !e.is_empty());

        if should_cache {
            let etag = etag.unwrap();
            let len = content_length.unwrap();
            let local_cache = self.local_cache.clone();
            let remote_cache = self.remote_cache.clone();
            let is_hf_host = target.host.contains("huggingface");
            let etag_for_finish = etag.clone();

            match local_cache.create_blob_writer(
                &etag,
                len,
                Box::new(move || {
                    if is_hf_host {
                        let path = local_cache.file_path(&etag_for_finish);
                        let etag = etag_for_finish.clone();
                        tokio::spawn(async move {
                            remote_cache.upload_file(&etag, path).await;
                        });
                    }
                }),
            ) {
                Ok(writer) => {
                    let byte_stream = upstream_response
                        .bytes_stream()
                        .map_err(std::io::Error::other);
                    let tee = tee_stream(byte_stream, writer);
                    let body = Body::from_stream(tee);
                    return builder
                        .body(body)
                        .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "").into_response());
                }
                Err(err) => {
                    warn!(%etag, error = %err, "failed to open blob writer, serving without caching");
                }
            }
        }

        let body = Body::from_stream(upstream_response.bytes_stream());
        builder
            .body(body)
            .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "").into_response())
    }

    async fn proxy_passthrough(&self, target: &TargetUrl, method: Method, _headers: HeaderMap) -> Response {
        let request = self.http_client.request(
            reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET),
            &target.full,
        );
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let mut builder = Response::builder().status(status);
                for (name, value) in response.headers() {
                    builder = builder.header(name, value);
                }
                let body = Body::from_stream(response.bytes_stream());
                builder
                    .body(body)
                    .unwrap_or_else(|_| (StatusCode::INTERNAL_SERVER_ERROR, "").into_response())
            }
            Err(err) => ProxyError::Upstream(err.to_string()).into_response(),
        }
    }

    /// Mirrors the reference's `ModifyHfFileLocation`: rewrites `meta`'s
    /// recorded location to route back through this proxy, swapping the
    /// penultimate path segment for the commit hash unless the location is
    /// already on the LFS CDN host, and carrying the etag forward as a query
    /// parameter so a later request can skip the metadata lookup entirely.
    fn modify_file_location(&self, meta: &FileMetadata) -> Option<String> {
        if !meta.is_cacheable() {
            return None;
        }

        let location = if meta.location.contains("cdn-lfs.huggingface.co") {
            meta.location.clone()
        } else {
            replace_penultimate_segment(&meta.location, &meta.commit_hash)
        };

        Some(format!(
            "{}{}?{ETAG_QUERY_PARAM}={}",
            self.proxy_url.trim_end_matches('/'),
            location,
            meta.etag
        ))
    }

    fn rewrite_redirect_location(&self, location: &str) -> String {
        format!("{}{}", self.proxy_url.trim_end_matches('/'), location)
    }
}

pub type SharedOrchestrator = Arc<Orchestrator>;

struct TargetUrl {
    full: String,
    host: String,
}

/// Recovers the real destination URL and host from the path+query this
/// proxy received, which for a rewritten `Location` embeds the full target
/// URL (scheme included) directly after this proxy's own base path.
fn parse_target_url(origin_url: &str) -> Option<TargetUrl> {
    let without_scheme = origin_url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = without_scheme.split('/').next()?.to_string();
    if host.is_empty() {
        return None;
    }
    let full = if origin_url.starts_with("http://") || origin_url.starts_with("https://") {
        origin_url.to_string()
    } else {
        format!("https://{origin_url}")
    };
    Some(TargetUrl { full, host })
}

fn extract_etag(target: &TargetUrl, headers: &HeaderMap) -> Option<String> {
    if let Some(query) = target.full.split('?').nth(1) {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix(&format!("{ETAG_QUERY_PARAM}=")) {
                return Some(value.to_string());
            }
        }
    }
    headers
        .get(ETAG_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Removes the `key=...` pair from `url`'s query string, if present, leaving
/// every other query param (and the URL otherwise) untouched. Used to strip
/// this proxy's own injected `x-etag` identifier off a URL before it is sent
/// to the real upstream or CDN.
fn strip_query_param(url: &str, key: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let prefix = format!("{key}=");
    let remaining: Vec<&str> = query.split('&').filter(|pair| !pair.starts_with(&prefix)).collect();
    if remaining.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", remaining.join("&"))
    }
}

struct HgUri {
    project: String,
    file: String,
    revision: String,
}

/// Equivalent of the reference's `huggingface.co/(.*)/resolve/(.*)` regex
/// followed by splitting the remainder on its first `/`.
fn parse_hg_uri(url: &str) -> Option<HgUri> {
    let idx = url.find("huggingface.co/")?;
    let rest = &url[idx + "huggingface.co/".len()..];
    let (project, rev_file) = rest.split_once("/resolve/")?;
    let (revision, file) = rev_file.split_once('/')?;
    Some(HgUri {
        project: project.to_string(),
        file: file.to_string(),
        revision: revision.to_string(),
    })
}

/// Equivalent of the reference's `cdn-lfs.huggingface.co/(.*)/([0-9a-zA-Z]+)?.*`
/// regex: the etag is the leading alphanumeric run of the final path segment.
fn etag_from_cdn_uri(url: &str) -> Option<String> {
    let idx = url.find("cdn-lfs.huggingface.co/")?;
    let rest = &url[idx..];
    let last_segment = rest.rsplit('/').next()?;
    let etag: String = last_segment
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    if etag.is_empty() {
        None
    } else {
        Some(etag)
    }
}

fn replace_penultimate_segment(location: &str, replacement: &str) -> String {
    let mut segments: Vec<&str> = location.split('/').collect();
    if segments.len() < 2 {
        return location.to_string();
    }
    let penultimate = segments.len() - 2;
    let owned = replacement.to_string();
    segments[penultimate] = owned.as_str();
    segments.join("/")
}

fn metadata_from_response_headers(headers: &reqwest::header::HeaderMap, revision: &str) -> FileMetadata {
    let header_str = |name: &str| -> String {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim_matches('"')
            .to_string()
    };
    let etag = {
        let plain = header_str("etag");
        if plain.is_empty() {
            header_str("x-linked-etag")
        } else {
            plain
        }
    };
    let size = {
        let linked = header_str("x-linked-size");
        if linked.is_empty() {
            header_str("content-length")
        } else {
            linked
        }
    };
    FileMetadata {
        tag: revision.to_string(),
        commit_hash: header_str("x-repo-commit"),
        etag,
        location: header_str("location"),
        size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hg_resolve_uri() {
        let hg = parse_hg_uri("https://huggingface.co/org/model/resolve/main/config.json").unwrap();
        assert_eq!(hg.project, "org/model");
        assert_eq!(hg.revision, "main");
        assert_eq!(hg.file, "config.json");
    }

    #[test]
    fn extracts_cdn_etag_prefix() {
        let etag = etag_from_cdn_uri(
            "https://cdn-lfs.huggingface.co/repos/ab/cd/deadbeefcafe0123?Expires=123",
        )
        .unwrap();
        assert_eq!(etag, "deadbeefcafe0123");
    }

    #[test]
    fn cdn_uri_without_match_returns_none() {
        assert!(etag_from_cdn_uri("https://huggingface.co/org/model/resolve/main/x").is_none());
    }

    #[test]
    fn replaces_penultimate_path_segment() {
        let location = "https://example.com/repos/main/file.bin";
        assert_eq!(
            replace_penultimate_segment(location, "deadbeef"),
            "https://example.com/repos/deadbeef/file.bin"
        );
    }

    #[test]
    fn parse_target_url_recovers_host() {
        let target = parse_target_url("huggingface.co/org/model/resolve/main/config.json").unwrap();
        assert_eq!(target.host, "huggingface.co");
        assert_eq!(target.full, "https://huggingface.co/org/model/resolve/main/config.json");
    }

    #[test]
    fn strip_query_param_removes_only_the_named_pair() {
        let url = "https://cdn-lfs.huggingface.co/repo/abc123?x-etag=abc123&Expires=123";
        assert_eq!(
            strip_query_param(url, "x-etag"),
            "https://cdn-lfs.huggingface.co/repo/abc123?Expires=123"
        );
    }

    #[test]
    fn strip_query_param_drops_trailing_question_mark_when_query_becomes_empty() {
        let url = "https://huggingface.co/org/model/resolve/main/config.json?x-etag=abc123";
        assert_eq!(
            strip_query_param(url, "x-etag"),
            "https://huggingface.co/org/model/resolve/main/config.json"
        );
    }

    #[test]
    fn strip_query_param_is_noop_without_a_query_string() {
        let url = "https://huggingface.co/org/model/resolve/main/config.json";
        assert_eq!(strip_query_param(url, "x-etag"), url);
    }
}
