#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Drivers and workers of the batch jobs.
//!
//! * [`dispatcher`] fans a replication manifest out to the job queue,
//!   skipping objects that already exist at their destination.
//! * [`replicate`] loads the input manifest and publishes the per-outcome
//!   output manifests around a dispatch run.
//! * [`bucket_manifest`] drives the bucket manifest job: one metadata job
//!   per object, results collected from a message queue.
//! * [`metadata`] is the worker side of the bucket manifest job.
//! * [`bucket_replicate`] copies objects between buckets: one copy job per
//!   key of a bucket or per row of a copy manifest.

pub mod bucket_manifest;
pub mod bucket_replicate;
pub mod dispatcher;
pub mod metadata;
pub mod replicate;

use replicator_manifest::ManifestError;
use replicator_queue::QueueError;
use replicator_storage::StorageError;
use replicator_transfer::TransferError;

pub use dispatcher::{DispatchConfig, DispatchReport, Dispatcher};

/// Errors that stop a whole run.
///
/// Per-record failures never surface here; they are counted as
/// [`replicator_models::JobOutcome::Failed`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The job queue refused our credentials.
    #[error("Permission denied submitting to job queue {job_queue}: {source}")]
    PermissionDenied {
        /// Job queue that refused the submission.
        job_queue: String,
        /// Underlying queue error.
        source: QueueError,
    },

    /// A queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A storage operation failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A manifest could not be read or written.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// A message could not be encoded.
    #[error("Failed to encode message: {0}")]
    Json(#[from] serde_json::Error),

    /// A copy job's source object does not exist.
    #[error("Source object s3://{bucket}/{key} does not exist")]
    MissingSource {
        /// Source bucket.
        bucket: String,
        /// Object key.
        key: String,
    },

    /// Copying an object failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// A local file could not be read.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}
