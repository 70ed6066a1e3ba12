//! Thin HEAD-probe client against the upstream model hub, used to resolve
//! the canonical metadata for a `(project, file, revision)` triple when
//! neither the local index nor the remote mirror has it.

use std::time::Duration;

use reqwest::{redirect::Policy, Client, StatusCode};
use tracing::warn;

use crate::metacache::FileMetadata;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct UpstreamProbe {
    client: Client,
    base_url: String,
}

impl UpstreamProbe {
    /// `base_url` is the scheme+host of the upstream hub, e.g.
    /// `https://huggingface.co`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(PROBE_TIMEOUT)
            // the proxy needs the raw redirect response (Location + headers),
            // never a followed one.
            .redirect(Policy::none())
            .build()
            .expect("static reqwest client config is always valid");

        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// HEADs `{base_url}/{project}/resolve/{revision}/{file}` and extracts
    /// the metadata the response carries. On any network failure, logs and
    /// returns an empty (non-cacheable) record rather than propagating the
    /// error, since a probe miss should fall through to a normal proxied
    /// request rather than fail the whole lookup.
    pub async fn file_meta(&self, project: &str, file: &str, revision: &str) -> FileMetadata {
        let url = format!(
            "{}/{project}/resolve/{revision}/{file}",
            self.base_url.trim_end_matches('/')
        );

        let response = match self.client.head(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(%url, error = %err, "upstream metadata probe failed");
                return FileMetadata::default();
            }
        };

        if !matches!(
            response.status(),
            StatusCode::OK | StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND
        ) {
            warn!(%url, status = %response.status(), "unexpected status from upstream metadata probe");
            return FileMetadata::default();
        }

        metadata_from_headers(response.headers(), revision)
    }
}

/// Mirrors the reference's header extraction: `Location` is the
/// content-delivery URL, `Etag` (falling back to `X-Linked-Etag`) is the
/// content identity, `X-Repo-Commit` is the commit hash, and
/// `X-Linked-Size` (falling back to `Content-Length`) is the size.
fn metadata_from_headers(headers: &reqwest::header::HeaderMap, revision: &str) -> FileMetadata {
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
    use reqwest::header::{HeaderMap, HeaderValue};

    use super::*;

    #[test]
    fn prefers_plain_etag_over_linked_etag() {
        let mut headers = HeaderMap::new();
        headers.insert("etag", HeaderValue::from_static("\"strong-etag\""));
        headers.insert("x-linked-etag", HeaderValue::from_static("\"weak-etag\""));
        headers.insert("x-repo-commit", HeaderValue::from_static("deadbeef"));
        headers.insert(
            "location",
            HeaderValue::from_static("https://cdn-lfs.huggingface.co/repo/ab/cd"),
        );

        let meta = metadata_from_headers(&headers, "main");
        assert_eq!(meta.etag, "strong-etag");
        assert_eq!(meta.commit_hash, "deadbeef");
        assert_eq!(meta.tag, "main");
        assert!(meta.is_cacheable());
    }

    #[test]
    fn falls_back_to_linked_etag_and_content_length() {
        let mut headers = HeaderMap::new();
        headers.insert("x-linked-etag", HeaderValue::from_static("\"only-etag\""));
        headers.insert("content-length", HeaderValue::from_static("1234"));

        let meta = metadata_from_headers(&headers, "main");
        assert_eq!(meta.etag, "only-etag");
        assert_eq!(meta.size, "1234");
    }

    #[test]
    fn missing_headers_yield_non_cacheable_record() {
        let headers = HeaderMap::new();
        let meta = metadata_from_headers(&headers, "main");
        assert!(!meta.is_cacheable());
    }
}
