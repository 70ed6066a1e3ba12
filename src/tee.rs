//! Duplicates a response body stream to the client and to a crash-safe blob
//! writer at the same time, so a download populates the local cache without
//! buffering the whole body in memory.

use bytes::Bytes;
use futures::{
    stream::{self, Stream},
    StreamExt,
};
use tracing::warn;

use crate::local_cache::BlobWriter;

struct TeeState<S> {
    inner: S,
    sink: Option<BlobWriter>,
}

/// Wraps `inner`, writing every successfully polled chunk to `sink` before
/// yielding it downstream. `sink` is closed (commit-or-discard, see
/// [`BlobWriter::finish`]) once `inner` is exhausted or errors. If this
/// stream itself is dropped before reaching either of those (a client
/// disconnect mid-download), `sink`'s own `Drop` impl discards the tmp file —
/// in every early-exit case the tmp file was never renamed into place, so the
/// cache simply never sees the blob, and nothing is left behind on disk.
pub fn tee_stream<S, E>(inner: S, sink: BlobWriter) -> impl Stream<Item = Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    stream::unfold(
        TeeState {
            inner,
            sink: Some(sink),
        },
        |mut state| async move {
            match state.inner.next().await {
                Some(Ok(chunk)) => {
                    if let Some(sink) = state.sink.as_mut() {
                        if let Err(err) = sink.write_all(&chunk).await {
                            warn!(error = %err, "tee write to blob cache failed, abandoning cache copy");
                            state.sink = None;
                        }
                    }
                    Some((Ok(chunk), state))
                }
                Some(Err(err)) => {
                    if let Some(mut sink) = state.sink.take() {
                        sink.finish().await;
                    }
                    Some((Err(err), state))
                }
                None => {
                    if let Some(mut sink) = state.sink.take() {
                        sink.finish().await;
                    }
                    None
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::local_cache::{FileLocalCache, LocalBlobCache};

    #[tokio::test]
    async fn full_stream_commits_blob() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileLocalCache::new(dir.path()).await.unwrap();
        let finished = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let finished2 = finished.clone();

        let writer = cache
            .create_blob_writer(
                "abc123",
                10,
                Box::new(move || finished2.store(true, std::sync::atomic::Ordering::SeqCst)),
            )
            .unwrap();

        let body: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(b"hello")), Ok(Bytes::from_static(b"world"))];
        let inner = stream::iter(body);
        let mut tee = Box::pin(tee_stream(inner, writer));

        let mut collected = Vec::new();
        while let Some(chunk) = tee.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }

        assert_eq!(collected, b"helloworld");
        assert!(finished.load(std::sync::atomic::Ordering::SeqCst));
        assert!(cache.has_file("abc123"));
    }

    #[tokio::test]
    async fn early_drop_leaves_blob_uncommitted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileLocalCache::new(dir.path()).await.unwrap();
        let tmp_path = {
            let mut p = cache.file_path("abc123").into_os_string();
            p.push(".tmp");
            std::path::PathBuf::from(p)
        };

        let writer = cache
            .create_blob_writer("abc123", 10, Box::new(|| {}))
            .unwrap();

        let body: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(b"hello"))];
        let inner = stream::iter(body);
        let mut tee = Box::pin(tee_stream(inner, writer));
        // consume only the first chunk, then drop before the stream ends,
        // simulating a client disconnecting mid-download.
        let _ = tee.next().await;
        drop(tee);

        assert!(!cache.has_file("abc123"));
        assert!(!tmp_path.exists(), "abandoned tmp file must not be left on disk");
    }

    #[tokio::test]
    async fn write_failure_abandons_cache_copy_without_breaking_client_stream() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileLocalCache::new(dir.path()).await.unwrap();

        let mut writer = cache
            .create_blob_writer("abc123", 5, Box::new(|| {}))
            .unwrap();
        // force a write failure downstream by finishing (and thus closing)
        // the writer before the tee ever touches it.
        writer.finish().await;

        let body: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(b"hello"))];
        let inner = stream::iter(body);
        let mut tee = Box::pin(tee_stream(inner, writer));

        let first = tee.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"hello");
        assert!(tee.next().await.is_none());
    }
}
