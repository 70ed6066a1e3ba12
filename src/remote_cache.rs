//! Best-effort mirror of local blobs into a remote object store, fed by a
//! bounded queue and drained by a fixed pool of workers.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::{path::Path as StorePath, ObjectStore};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::RemoteCacheConfig;

const QUEUE_CAPACITY: usize = 1024;

/// A remote object's content as a chunked byte stream, suitable for
/// reverse-proxying straight into a response body without buffering the
/// whole object in memory.
pub type ObjectByteStream = BoxStream<'static, object_store::Result<Bytes>>;

/// Capability trait for the remote mirror, narrow enough to substitute a
/// fake in tests.
#[async_trait::async_trait]
pub trait RemoteCache: Send + Sync {
    /// Enqueues `local_path` (keyed by `etag`) for upload, unless a matching
    /// object already exists remotely. Never blocks on the network; returns
    /// once the job is queued or silently dropped because the queue is full.
    async fn upload_file(&self, etag: &str, local_path: std::path::PathBuf);
    /// Probes the remote store for an object keyed by `etag`. Returns the
    /// externally-reachable request URL for it, if present.
    async fn stat_file(&self, etag: &str) -> Option<String>;
    /// Fetches the object keyed by `etag` as a byte stream, for reverse
    /// proxying to the client. Returns `None` if no such object exists.
    async fn fetch_file(&self, etag: &str) -> Option<ObjectByteStream>;
    /// Builds the request URL for `etag` without checking existence.
    fn get_request(&self, etag: &str) -> String;
}

struct UploadJob {
    etag: String,
    local_path: std::path::PathBuf,
}

pub struct ObjectStoreMirror {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    store_url: String,
    sender: mpsc::Sender<UploadJob>,
}

impl ObjectStoreMirror {
    /// Builds the mirror and spawns `cfg.concurrent` worker tasks draining
    /// the upload queue. Workers run for the lifetime of the process; there
    /// is no drain-on-shutdown, matching the reference's fire-and-forget
    /// mirroring contract (an in-flight upload at shutdown is simply lost).
    pub fn new(cfg: &RemoteCacheConfig) -> Result<Self> {
        let (store, path) = object_store::parse_url_opts(
            &url::Url::parse(&cfg.store_url).with_context(|| {
                format!("invalid remote_cache.store-url {:?}", cfg.store_url)
            })?,
            cfg.store_options.clone(),
        )
        .with_context(|| format!("failed to build object store for {:?}", cfg.store_url))?;
        let _ = path;

        let store: Arc<dyn ObjectStore> = Arc::from(store);
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        for worker_id in 0..cfg.concurrent.max(1) {
            let store = store.clone();
            let receiver = receiver.clone();
            let prefix = cfg.cache_dir.clone();
            tokio::spawn(async move {
                upload_worker(worker_id, store, receiver, prefix).await;
            });
        }

        Ok(Self {
            store,
            prefix: cfg.cache_dir.clone(),
            store_url: cfg.store_url.clone(),
            sender,
        })
    }

    fn remote_path(&self, etag: &str) -> StorePath {
        StorePath::from(format!("{}{}", self.prefix, etag))
    }
}

async fn upload_worker(
    worker_id: usize,
    store: Arc<dyn ObjectStore>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<UploadJob>>>,
    prefix: String,
) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(job) = job else {
            debug!(worker_id, "upload queue closed, worker exiting");
            return;
        };

        let remote_path = StorePath::from(format!("{prefix}{}", job.etag));
        match tokio::fs::read(&job.local_path).await {
            Ok(bytes) => match store.put(&remote_path, bytes.into()).await {
                Ok(_) => info!(worker_id, etag = %job.etag, "mirrored blob to remote store"),
                Err(err) => warn!(worker_id, etag = %job.etag, error = %err, "failed to upload blob to remote store"),
            },
            Err(err) => warn!(worker_id, path = %job.local_path.display(), error = %err, "failed to read local blob for upload"),
        }
    }
}

#[async_trait::async_trait]
impl RemoteCache for ObjectStoreMirror {
    async fn upload_file(&self, etag: &str, local_path: std::path::PathBuf) {
        if self.stat_file(etag).await.is_some() {
            debug!(etag, "remote object already present, skipping upload");
            return;
        }

        let job = UploadJob {
            etag: etag.to_string(),
            local_path,
        };
        if let Err(err) = self.sender.try_send(job) {
            warn!(etag, error = %err, "upload queue full or closed, dropping upload");
        }
    }

    async fn stat_file(&self, etag: &str) -> Option<String> {
        let path = self.remote_path(etag);
        match self.store.head(&path).await {
            Ok(_) => Some(self.get_request(etag)),
            Err(object_store::Error::NotFound { .. }) => None,
            Err(err) => {
                error!(etag, error = %err, "failed to stat remote object");
                None
            }
        }
    }

    async fn fetch_file(&self, etag: &str) -> Option<ObjectByteStream> {
        let path = self.remote_path(etag);
        match self.store.get(&path).await {
            Ok(result) => Some(result.into_stream()),
            Err(object_store::Error::NotFound { .. }) => None,
            Err(err) => {
                error!(etag, error = %err, "failed to fetch remote object");
                None
            }
        }
    }

    fn get_request(&self, etag: &str) -> String {
        format!(
            "{}/{}{}",
            self.store_url.trim_end_matches('/'),
            self.prefix,
            etag
        )
    }
}

pub type SharedRemoteCache = Arc<dyn RemoteCache>;
