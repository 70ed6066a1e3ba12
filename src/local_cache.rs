//! Content-addressed on-disk blob store keyed by etag, with a crash-safe,
//! length-validated writer and a static file view for cache hits.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use fs4::FileExt;
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{error, warn};

const TMP_SUFFIX: &str = ".tmp";

/// Capability trait for the local blob cache, narrow enough to substitute a
/// fake in tests.
pub trait LocalBlobCache: Send + Sync {
    fn has_file(&self, etag: &str) -> bool;
    fn file_path(&self, etag: &str) -> PathBuf;
    /// Opens a crash-safe writer for `etag`. `on_finish` runs once, after the
    /// tmp file has been renamed into place, iff the full `expected_len`
    /// bytes were written.
    fn create_blob_writer(
        &self,
        etag: &str,
        expected_len: u64,
        on_finish: Box<dyn FnOnce() + Send>,
    ) -> Result<BlobWriter>;
}

pub struct FileLocalCache {
    blob_dir: PathBuf,
}

impl FileLocalCache {
    pub async fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let blob_dir = cache_dir.into();
        tokio::fs::create_dir_all(&blob_dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", blob_dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o766);
            let _ = std::fs::set_permissions(&blob_dir, perms);
        }
        Ok(Self { blob_dir })
    }
}

impl LocalBlobCache for FileLocalCache {
    fn has_file(&self, etag: &str) -> bool {
        self.file_path(etag).is_file()
    }

    fn file_path(&self, etag: &str) -> PathBuf {
        self.blob_dir.join(etag)
    }

    fn create_blob_writer(
        &self,
        etag: &str,
        expected_len: u64,
        on_finish: Box<dyn FnOnce() + Send>,
    ) -> Result<BlobWriter> {
        let final_path = self.file_path(etag);
        let tmp_path = tmp_path_for(&final_path);

        // write-create (not truncate): a crashed writer's leftover tmp file
        // is overwritten in place by whoever successfully takes the lock.
        let std_file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&tmp_path)
            .with_context(|| format!("failed to open {}", tmp_path.display()))?;

        std_file
            .try_lock_exclusive()
            .with_context(|| format!("failed to lock {}", tmp_path.display()))?;

        let file = File::from_std(std_file);

        Ok(BlobWriter {
            file: Some(file),
            tmp_path,
            final_path,
            expected_len,
            bytes_written: 0,
            on_finish: Some(on_finish),
        })
    }
}

fn tmp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

/// A writer for one in-flight blob download.
///
/// On [`BlobWriter::finish`] (or drop), the tmp file is renamed into place
/// and `on_finish` invoked only if exactly `expected_len` bytes were
/// written; otherwise the tmp file is discarded.
pub struct BlobWriter {
    file: Option<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    expected_len: u64,
    bytes_written: u64,
    on_finish: Option<Box<dyn FnOnce() + Send>>,
}

impl BlobWriter {
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .context("blob writer already finished")?;
        file.write_all(buf).await?;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    /// Commits or discards the blob depending on whether the declared
    /// length was met. Safe to call multiple times; a second call is a
    /// no-op.
    pub async fn finish(&mut self) {
        let Some(mut file) = self.file.take() else {
            return;
        };

        if let Err(err) = file.flush().await {
            warn!(path = %self.tmp_path.display(), error = %err, "failed to flush blob writer");
        }

        if self.bytes_written == self.expected_len {
            match tokio::fs::rename(&self.tmp_path, &self.final_path).await {
                Ok(()) => {
                    if let Some(on_finish) = self.on_finish.take() {
                        on_finish();
                    }
                }
                Err(err) => error!(
                    from = %self.tmp_path.display(),
                    to = %self.final_path.display(),
                    error = %err,
                    "failed to commit blob"
                ),
            }
        } else {
            warn!(
                path = %self.tmp_path.display(),
                expected = self.expected_len,
                actual = self.bytes_written,
                "blob write incomplete, discarding"
            );
            if let Err(err) = tokio::fs::remove_file(&self.tmp_path).await {
                warn!(path = %self.tmp_path.display(), error = %err, "failed to remove incomplete tmp file");
            }
        }

        // AsyncFileExt's lock is released when `file` (and its underlying fd)
        // is dropped here.
        drop(file);
    }
}

impl Drop for BlobWriter {
    /// Backstop for a writer that is dropped without `finish()` ever having
    /// run — a client disconnecting mid-download drops the tee stream, and
    /// therefore this writer, without necessarily driving it to a `None`/`Err`
    /// item. The lock is released by the `File`'s own `Drop` either way;
    /// this only needs to discard the orphaned tmp file synchronously, since
    /// `Drop` cannot `.await`.
    fn drop(&mut self) {
        if self.file.take().is_some() {
            warn!(path = %self.tmp_path.display(), "blob writer dropped before finishing, discarding tmp file");
            if let Err(err) = std::fs::remove_file(&self.tmp_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    error!(path = %self.tmp_path.display(), error = %err, "failed to remove abandoned tmp file");
                }
            }
        }
    }
}

pub type SharedLocalBlobCache = Arc<dyn LocalBlobCache>;
