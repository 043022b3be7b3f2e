//! Multipart transfer engine.
//!
//! One transfer moves one object:
//!
//! ```text
//! plan ─► create upload ─► (download part ─► upload part)* ─► complete
//!                  │                     │                       │
//!                  └──────── any failure or deadline ────────────┴─► abort
//! ```
//!
//! Parts run concurrently, bounded by [`TransferConfig::part_workers`], so
//! at most `chunk_size × part_workers` bytes are buffered at once. The
//! first failed part stops the remaining parts of the object.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt as _, TryStreamExt as _};
use replicator_models::progress::ProgressCallback;
use replicator_models::{ChunkRange, PartCompletion};
use replicator_retry::{RetryPolicy, retry};
use replicator_storage::{ObjectStore, StorageError};

use crate::planner::{self, DEFAULT_CHUNK_SIZE, PlanError};
use crate::source::{RangeSource, SourceError};

/// Default number of parts in flight per object.
pub const DEFAULT_PART_WORKERS: usize = 5;

/// Default per-object deadline.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(6 * 60 * 60);

/// Transfer settings, fixed for the lifetime of an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Part size in bytes.
    pub chunk_size: u64,
    /// Parts transferred concurrently.
    pub part_workers: usize,
    /// Retry policy of every download, upload and completion call.
    pub retry: RetryPolicy,
    /// Overall time limit per object; `None` disables it.
    pub deadline: Option<Duration>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            part_workers: DEFAULT_PART_WORKERS,
            retry: RetryPolicy::transfer(),
            deadline: Some(DEFAULT_DEADLINE),
        }
    }
}

/// Errors that end a transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The object cannot be split under the multipart constraints.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// The multipart upload could not be started.
    #[error("Failed to start multipart upload for s3://{bucket}/{key}: {source}")]
    Create {
        /// Destination bucket.
        bucket: String,
        /// Destination key.
        key: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// A part could not be downloaded.
    #[error("Failed to download part {part_number}: {source}")]
    Download {
        /// Failed part.
        part_number: u32,
        /// Underlying source error.
        source: SourceError,
    },

    /// The source returned a different number of bytes than requested.
    #[error("Part {part_number}: expected {expected} bytes, received {actual}")]
    ByteCountMismatch {
        /// Failed part.
        part_number: u32,
        /// Range length.
        expected: u64,
        /// Bytes received.
        actual: u64,
    },

    /// A part could not be uploaded.
    #[error("Failed to upload part {part_number}: {source}")]
    Upload {
        /// Failed part.
        part_number: u32,
        /// Underlying storage error.
        source: StorageError,
    },

    /// The multipart upload could not be completed.
    #[error("Failed to complete multipart upload {upload_id}: {source}")]
    Complete {
        /// Upload id.
        upload_id: String,
        /// Underlying storage error.
        source: StorageError,
    },

    /// The per-object deadline passed.
    #[error("Transfer of s3://{bucket}/{key} exceeded its {deadline:?} deadline")]
    DeadlineExceeded {
        /// Destination bucket.
        bucket: String,
        /// Destination key.
        key: String,
        /// Configured deadline.
        deadline: Duration,
    },
}

/// Moves objects from a [`RangeSource`] into an [`ObjectStore`] with
/// multipart uploads.
pub struct MultipartTransfer {
    store: Arc<dyn ObjectStore>,
    config: TransferConfig,
}

impl MultipartTransfer {
    /// Creates an engine writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, config: TransferConfig) -> Self {
        Self { store, config }
    }

    /// The engine's configuration.
    #[must_use]
    pub const fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Transfers `source` to `s3://bucket/key`.
    ///
    /// Returns one [`PartCompletion`] per planned part, ascending by part
    /// number, whose byte counts sum to the object size. `progress`
    /// receives bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError`] on the first unrecoverable failure. Plan
    /// errors are returned before any network call. Any failure after the
    /// upload was created aborts it first.
    pub async fn transfer(
        &self,
        source: &dyn RangeSource,
        bucket: &str,
        key: &str,
        progress: &dyn ProgressCallback,
    ) -> Result<Vec<PartCompletion>, TransferError> {
        let size = source.size();
        let parts = planner::plan(size, self.config.chunk_size)?;

        log::info!(
            "Transferring {} -> s3://{bucket}/{key} ({size} bytes, {} parts)",
            source.describe(),
            parts.len()
        );
        progress.set_total(size);
        progress.set_position(0);

        let upload_id = retry(&self.config.retry, "create multipart upload", |_| {
            self.store.create_multipart(bucket, key)
        })
        .await
        .map_err(|source| TransferError::Create {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source,
        })?;

        let run = self.upload_and_complete(source, bucket, key, &upload_id, &parts, progress);
        let result = match self.config.deadline {
            Some(deadline) => tokio::time::timeout(deadline, run).await.unwrap_or_else(|_| {
                Err(TransferError::DeadlineExceeded {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    deadline,
                })
            }),
            None => run.await,
        };

        match result {
            Ok(completions) => {
                log::info!(
                    "Completed s3://{bucket}/{key} ({} parts)",
                    completions.len()
                );
                progress.finish(format!("{key} done"));
                Ok(completions)
            }
            Err(e) => {
                log::error!("Transfer of s3://{bucket}/{key} failed: {e}");
                self.abort(bucket, key, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn upload_and_complete(
        &self,
        source: &dyn RangeSource,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[ChunkRange],
        progress: &dyn ProgressCallback,
    ) -> Result<Vec<PartCompletion>, TransferError> {
        let mut completions: Vec<PartCompletion> = futures::stream::iter(parts.iter().copied())
            .map(|range| self.transfer_part(source, bucket, key, upload_id, range, progress))
            .buffer_unordered(self.config.part_workers.max(1))
            .try_collect()
            .await?;

        completions.sort_by_key(|c| c.part_number);

        retry(&self.config.retry, "complete multipart upload", |_| {
            self.store
                .complete_multipart(bucket, key, upload_id, &completions)
        })
        .await
        .map_err(|source| TransferError::Complete {
            upload_id: upload_id.to_string(),
            source,
        })?;

        Ok(completions)
    }

    async fn transfer_part(
        &self,
        source: &dyn RangeSource,
        bucket: &str,
        key: &str,
        upload_id: &str,
        range: ChunkRange,
        progress: &dyn ProgressCallback,
    ) -> Result<PartCompletion, TransferError> {
        let part_number = range.part_number;

        let body = if range.length == 0 {
            Bytes::new()
        } else {
            let label = format!("download part {part_number} of {key}");
            retry(&self.config.retry, &label, |_| source.fetch(&range))
                .await
                .map_err(|source| TransferError::Download {
                    part_number,
                    source,
                })?
        };

        let actual = body.len() as u64;
        if actual != range.length {
            return Err(TransferError::ByteCountMismatch {
                part_number,
                expected: range.length,
                actual,
            });
        }

        let label = format!("upload part {part_number} of {key}");
        let e_tag = retry(&self.config.retry, &label, |_| {
            self.store
                .upload_part(bucket, key, upload_id, part_number, body.clone())
        })
        .await
        .map_err(|source| TransferError::Upload {
            part_number,
            source,
        })?;

        log::debug!("Uploaded part {part_number} of {key} ({actual} bytes)");
        progress.inc(actual);

        Ok(PartCompletion {
            part_number,
            e_tag,
            byte_count: actual,
        })
    }

    /// Aborts an upload. Failures are logged, never returned.
    async fn abort(&self, bucket: &str, key: &str, upload_id: &str) {
        log::warn!("Aborting multipart upload {upload_id} for s3://{bucket}/{key}");
        if let Err(e) = retry(&self.config.retry, "abort multipart upload", |_| {
            self.store.abort_multipart(bucket, key, upload_id)
        })
        .await
        {
            log::error!("Failed to abort multipart upload {upload_id}: {e}");
        }
    }
}
