//! Bucket to bucket replication.
//!
//! The driver submits one copy job per object, either for every key of a
//! source bucket or for the rows of a copy manifest whose `project_id`
//! picks the destination bucket. The worker copies one object with the
//! multipart engine, reading ranges of the source object.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt as _, TryStreamExt as _};
use replicator_manifest::copy::{CopyRow, read_copy_rows_from_bytes};
use replicator_models::progress::ProgressCallback;
use replicator_models::{DispatchSummary, JobOutcome};
use replicator_queue::{JobQueue, JobRequest};
use replicator_retry::RetryPolicy;
use replicator_storage::existence::{ExistenceCheck, check};
use replicator_storage::{ObjectStore, S3Location};
use replicator_transfer::{MultipartTransfer, StoreRangeSource};

use crate::DispatchError;
use crate::dispatcher::{DEFAULT_WORKERS, submit_with_retry};
use crate::replicate::{ManifestSource, read_source};

/// Job name of copies of a whole bucket.
pub const BUCKET_REPLICATE_JOB_NAME: &str = "bucket_replicate";

/// Job name of copies listed in a copy manifest.
pub const MAPPED_REPLICATE_JOB_NAME: &str = "dcf_bucket_replicate";

/// Environment variable names of a copy job.
pub mod env {
    /// Object key, the same in both buckets.
    pub const KEY: &str = "KEY";
    /// Bucket copied from.
    pub const SOURCE_BUCKET: &str = "SOURCE_BUCKET";
    /// Bucket copied to.
    pub const DESTINATION_BUCKET: &str = "DESTINATION_BUCKET";
}

/// Parameters of one copy job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyJob {
    /// Bucket copied from.
    pub source_bucket: String,
    /// Bucket copied to.
    pub destination_bucket: String,
    /// Object key.
    pub key: String,
}

impl CopyJob {
    /// Environment overrides passed to the job queue.
    #[must_use]
    pub fn environment(&self) -> BTreeMap<String, String> {
        [
            (env::KEY, self.key.clone()),
            (env::SOURCE_BUCKET, self.source_bucket.clone()),
            (env::DESTINATION_BUCKET, self.destination_bucket.clone()),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }
}

/// Copy driver settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyJobConfig {
    /// Job queue.
    pub job_queue: String,
    /// Job definition.
    pub job_definition: String,
    /// Submissions in flight.
    pub workers: usize,
    /// Backoff for throttled or failed submissions.
    pub retry: RetryPolicy,
}

impl CopyJobConfig {
    /// Default settings for the given queue and definition.
    #[must_use]
    pub fn new(job_queue: &str, job_definition: &str) -> Self {
        Self {
            job_queue: job_queue.to_string(),
            job_definition: job_definition.to_string(),
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::submission(),
        }
    }
}

/// Submits one `job_name` job per copy.
///
/// `progress` counts copies.
///
/// # Errors
///
/// Returns [`DispatchError::PermissionDenied`] if the job queue refused
/// our credentials.
pub async fn submit_copies(
    jobs: &dyn JobQueue,
    config: &CopyJobConfig,
    job_name: &str,
    copies: &[CopyJob],
    progress: &dyn ProgressCallback,
) -> Result<DispatchSummary, DispatchError> {
    progress.set_total(copies.len() as u64);

    let outcomes: Vec<JobOutcome> = stream::iter(copies.iter().map(|copy| async move {
        let request = JobRequest {
            job_name: job_name.to_string(),
            job_queue: config.job_queue.clone(),
            job_definition: config.job_definition.clone(),
            environment: copy.environment(),
        };
        let label = format!("{job_name} ({})", copy.key);
        let outcome = if submit_with_retry(jobs, &request, &config.retry, &label).await? {
            log::info!("Submitted copy of {} to {}", copy.key, copy.destination_bucket);
            JobOutcome::Submitted
        } else {
            JobOutcome::Failed
        };
        progress.inc(1);
        Ok::<_, DispatchError>(outcome)
    }))
    .buffer_unordered(config.workers.max(1))
    .try_collect()
    .await?;

    let mut summary = DispatchSummary::default();
    for outcome in outcomes {
        summary.record(outcome);
    }
    progress.finish(summary.to_string());
    Ok(summary)
}

/// Submits a copy of every object of `source_bucket` under `prefix` to
/// `destination_bucket`.
///
/// # Errors
///
/// Returns [`DispatchError`] if the source bucket cannot be listed or the
/// job queue refused our credentials.
pub async fn replicate_bucket(
    store: &dyn ObjectStore,
    jobs: &dyn JobQueue,
    config: &CopyJobConfig,
    source_bucket: &str,
    prefix: &str,
    destination_bucket: &str,
    progress: &dyn ProgressCallback,
) -> Result<DispatchSummary, DispatchError> {
    let keys = store.list_keys(source_bucket, prefix).await?;
    log::info!(
        "Copying {} objects from s3://{source_bucket}/{prefix} to {destination_bucket}",
        keys.len()
    );

    let copies: Vec<CopyJob> = keys
        .into_iter()
        .map(|key| CopyJob {
            source_bucket: source_bucket.to_string(),
            destination_bucket: destination_bucket.to_string(),
            key,
        })
        .collect();

    let summary =
        submit_copies(jobs, config, BUCKET_REPLICATE_JOB_NAME, &copies, progress).await?;
    log::info!("Bucket copy submitted: {summary}");
    Ok(summary)
}

/// Key of a copy manifest `url` in `source_bucket`.
///
/// An `s3://` URL contributes its key; anything else is the key itself.
/// Returns `None` for an empty key.
#[must_use]
pub fn key_from_url(url: &str, source_bucket: &str) -> Option<String> {
    let key = match S3Location::parse(url) {
        Ok(location) => {
            if location.bucket != source_bucket {
                log::warn!("{url} is outside {source_bucket}; using its key");
            }
            location.key
        }
        Err(_) => url.trim_start_matches('/').to_string(),
    };
    Some(key).filter(|k| !k.is_empty())
}

/// Submits a copy of every row of a copy manifest, to the bucket
/// `destinations` maps the row's `project_id` to.
///
/// `destinations` is a JSON object of `project_id` to bucket name. Rows
/// with an unmapped project or an empty url count as failed.
///
/// # Errors
///
/// Returns [`DispatchError`] if the manifest or the map cannot be read or
/// decoded, or the job queue refused our credentials.
pub async fn replicate_mapped(
    store: &dyn ObjectStore,
    jobs: &dyn JobQueue,
    config: &CopyJobConfig,
    source_bucket: &str,
    manifest: &ManifestSource,
    destinations: &ManifestSource,
    progress: &dyn ProgressCallback,
) -> Result<DispatchSummary, DispatchError> {
    let rows = read_copy_rows_from_bytes(&read_source(store, manifest).await?)?;
    let destinations: BTreeMap<String, String> =
        serde_json::from_slice(&read_source(store, destinations).await?)?;

    let mut unmapped = DispatchSummary::default();
    let copies: Vec<CopyJob> = rows
        .iter()
        .filter_map(|row| match copy_for_row(row, source_bucket, &destinations) {
            Some(copy) => Some(copy),
            None => {
                unmapped.record(JobOutcome::Failed);
                None
            }
        })
        .collect();

    let submitted =
        submit_copies(jobs, config, MAPPED_REPLICATE_JOB_NAME, &copies, progress).await?;
    let summary = DispatchSummary {
        failed: submitted.failed + unmapped.failed,
        ..submitted
    };
    log::info!("Mapped copy of {} rows submitted: {summary}", rows.len());
    Ok(summary)
}

fn copy_for_row(
    row: &CopyRow,
    source_bucket: &str,
    destinations: &BTreeMap<String, String>,
) -> Option<CopyJob> {
    let Some(destination_bucket) = destinations.get(&row.project_id) else {
        log::error!(
            "No job submitted for {}: no destination bucket for project {}",
            row.label(),
            row.project_id
        );
        return None;
    };
    let Some(key) = key_from_url(&row.url, source_bucket) else {
        log::error!("No job submitted for {}: empty url", row.label());
        return None;
    };
    Some(CopyJob {
        source_bucket: source_bucket.to_string(),
        destination_bucket: destination_bucket.clone(),
        key,
    })
}

/// Result of one copy job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The object was copied in this many parts.
    Copied {
        /// Uploaded parts.
        parts: usize,
    },
    /// The destination already held the same object.
    AlreadyPresent,
}

/// Copies one object, unless the destination already holds it.
///
/// # Errors
///
/// Returns [`DispatchError::MissingSource`] if the source object does not
/// exist, or [`DispatchError`] if reading it or uploading the copy fails.
pub async fn copy_object(
    store: Arc<dyn ObjectStore>,
    engine: &MultipartTransfer,
    job: &CopyJob,
    progress: &dyn ProgressCallback,
) -> Result<CopyOutcome, DispatchError> {
    let Some(source) = store.head(&job.source_bucket, &job.key).await? else {
        return Err(DispatchError::MissingSource {
            bucket: job.source_bucket.clone(),
            key: job.key.clone(),
        });
    };

    match check(
        store.as_ref(),
        &job.destination_bucket,
        &job.key,
        source.size,
        source.md5(),
    )
    .await
    {
        ExistenceCheck::Exists => {
            log::info!(
                "s3://{}/{} already exists, skipping",
                job.destination_bucket,
                job.key
            );
            return Ok(CopyOutcome::AlreadyPresent);
        }
        ExistenceCheck::NotFound => {}
        other => log::warn!(
            "s3://{}/{}: {other}, copying",
            job.destination_bucket,
            job.key
        ),
    }

    log::info!(
        "Copying s3://{}/{} ({} bytes) to {}",
        job.source_bucket,
        job.key,
        source.size,
        job.destination_bucket
    );
    let reader = StoreRangeSource::new(
        Arc::clone(&store),
        &job.source_bucket,
        &job.key,
        source.size,
    );
    let parts = engine
        .transfer(&reader, &job.destination_bucket, &job.key, progress)
        .await?;

    Ok(CopyOutcome::Copied { parts: parts.len() })
}
