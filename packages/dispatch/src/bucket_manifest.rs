//! Bucket manifest job.
//!
//! Lists a bucket, submits one metadata job per object, collects the
//! workers' messages from the results queue and uploads a `url, size, md5`
//! manifest of the bucket.

use bytes::Bytes;
use chrono::{DateTime, TimeZone};
use futures::stream::{self, StreamExt as _, TryStreamExt as _};
use replicator_manifest::bucket::{bucket_manifest_file_name, encode_bucket_manifest};
use replicator_models::progress::ProgressCallback;
use replicator_models::{MetadataMessage, ObjectMetadata};
use replicator_queue::{JobQueue, JobRequest, MessageQueue, drain};
use replicator_retry::RetryPolicy;
use replicator_storage::ObjectStore;

use crate::DispatchError;
use crate::dispatcher::{DEFAULT_WORKERS, submit_with_retry};
use crate::metadata::MetadataJob;

/// Job name of metadata jobs.
pub const METADATA_JOB_NAME: &str = "bucket_manifest";

/// Bucket manifest job settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestJobConfig {
    /// Bucket to describe.
    pub bucket: String,
    /// Only keys under this prefix are listed.
    pub prefix: String,
    /// Job queue.
    pub job_queue: String,
    /// Job definition.
    pub job_definition: String,
    /// Results queue name or URL, passed to the workers.
    pub results_queue: String,
    /// Bucket receiving the manifest.
    pub out_bucket: String,
    /// Submissions in flight.
    pub workers: usize,
    /// Backoff for throttled or failed submissions.
    pub retry: RetryPolicy,
    /// Wait between polls of an empty results queue, and how many
    /// consecutive empty polls to tolerate.
    pub idle: RetryPolicy,
}

impl ManifestJobConfig {
    /// Default settings.
    #[must_use]
    pub fn new(
        bucket: &str,
        job_queue: &str,
        job_definition: &str,
        results_queue: &str,
        out_bucket: &str,
    ) -> Self {
        Self {
            bucket: bucket.to_string(),
            prefix: String::new(),
            job_queue: job_queue.to_string(),
            job_definition: job_definition.to_string(),
            results_queue: results_queue.to_string(),
            out_bucket: out_bucket.to_string(),
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::submission(),
            idle: RetryPolicy::queue_idle(),
        }
    }
}

/// Result of a bucket manifest run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketManifestReport {
    /// Keys listed in the bucket.
    pub keys: usize,
    /// Metadata jobs accepted by the job queue.
    pub submitted: usize,
    /// Metadata jobs that could not be submitted.
    pub failed: usize,
    /// Whether a message arrived for every submitted job.
    pub complete: bool,
    /// Manifest rows, in receive order.
    pub rows: Vec<ObjectMetadata>,
    /// Key of the uploaded manifest in the output bucket.
    pub manifest_key: String,
}

/// Parses one worker message into a manifest row.
///
/// A body that is not a metadata message becomes an error row so the
/// manifest still accounts for it.
#[must_use]
pub fn parse_message(body: &str) -> ObjectMetadata {
    match serde_json::from_str::<MetadataMessage>(body) {
        Ok(message) => message.into_metadata(),
        Err(e) => {
            log::warn!("Unreadable metadata message '{body}': {e}");
            MetadataMessage::failure(None, format!("invalid message: {e}")).into_metadata()
        }
    }
}

/// Runs the bucket manifest job.
///
/// 1. Purge the results queue so stale messages are not counted.
/// 2. List every key of the bucket.
/// 3. Submit one metadata job per key.
/// 4. Drain one message per submitted job, waiting per `config.idle`.
/// 5. Upload `manifest_<bucket>_<timestamp>.tsv` to `config.out_bucket`.
///
/// An incomplete drain still produces a manifest of what was received.
/// `progress` counts submitted jobs.
///
/// # Errors
///
/// Returns [`DispatchError`] if the results queue does not exist, the job
/// queue refuses our credentials, the bucket cannot be listed or the
/// manifest cannot be uploaded.
pub async fn run<Tz>(
    store: &dyn ObjectStore,
    jobs: &dyn JobQueue,
    results: &dyn MessageQueue,
    config: &ManifestJobConfig,
    started_at: &DateTime<Tz>,
    progress: &dyn ProgressCallback,
) -> Result<BucketManifestReport, DispatchError>
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    results.purge().await?;

    let keys = store.list_keys(&config.bucket, &config.prefix).await?;
    log::info!(
        "Found {} objects in s3://{}/{}",
        keys.len(),
        config.bucket,
        config.prefix
    );
    progress.set_total(keys.len() as u64);

    let accepted: Vec<bool> = stream::iter(keys.iter().map(|key| async move {
        let job = MetadataJob {
            bucket: config.bucket.clone(),
            key: key.clone(),
            queue: config.results_queue.clone(),
        };
        let request = JobRequest {
            job_name: METADATA_JOB_NAME.to_string(),
            job_queue: config.job_queue.clone(),
            job_definition: config.job_definition.clone(),
            environment: job.environment(),
        };
        let label = format!("{METADATA_JOB_NAME} ({key})");
        let submitted = submit_with_retry(jobs, &request, &config.retry, &label).await?;
        progress.inc(1);
        Ok::<_, DispatchError>(submitted)
    }))
    .buffer_unordered(config.workers.max(1))
    .try_collect()
    .await?;

    let submitted = accepted.iter().filter(|ok| **ok).count();
    let failed = accepted.len() - submitted;
    progress.finish(format!("{submitted} metadata jobs submitted"));
    log::info!("Submitted {submitted} metadata jobs ({failed} failed)");

    let drained = drain(results, submitted, &config.idle).await?;
    if !drained.complete {
        log::warn!(
            "Received {} of {submitted} metadata messages; the manifest is incomplete",
            drained.messages.len()
        );
    }

    let rows: Vec<ObjectMetadata> = drained
        .messages
        .iter()
        .map(|body| parse_message(body))
        .collect();

    let manifest_key = bucket_manifest_file_name(&config.bucket, started_at);
    let body = encode_bucket_manifest(&rows)?;
    store
        .put(&config.out_bucket, &manifest_key, Bytes::from(body))
        .await?;
    log::info!(
        "Uploaded manifest of {} objects to s3://{}/{manifest_key}",
        rows.len(),
        config.out_bucket
    );

    Ok(BucketManifestReport {
        keys: keys.len(),
        submitted,
        failed,
        complete: drained.complete,
        rows,
        manifest_key,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use replicator_models::progress::NullProgress;
    use replicator_queue::memory::{MemoryJobQueue, MemoryMessageQueue};
    use replicator_queue::{JobQueue, QueueError, QueueFailure};
    use replicator_storage::memory::MemoryStore;

    use super::*;
    use crate::metadata::{self, env};

    /// Job queue that runs each metadata job inline, like a worker would.
    struct InlineWorkers {
        store: Arc<MemoryStore>,
        results: Arc<MemoryMessageQueue>,
        submitted: MemoryJobQueue,
    }

    #[async_trait::async_trait]
    impl JobQueue for InlineWorkers {
        async fn submit(&self, request: &JobRequest) -> Result<(), QueueError> {
            self.submitted.submit(request).await?;
            metadata::run(
                self.store.as_ref(),
                self.results.as_ref(),
                &request.environment[env::BUCKET],
                &request.environment[env::KEY],
                &RetryPolicy::immediate(1),
            )
            .await
            .map_err(|e| QueueError::Request {
                operation: "SubmitJob",
                target: request.job_queue.clone(),
                kind: QueueFailure::Rejected,
                source: e.to_string().into(),
            })?;
            Ok(())
        }
    }

    fn config() -> ManifestJobConfig {
        ManifestJobConfig {
            retry: RetryPolicy::immediate(2),
            idle: RetryPolicy::immediate(2),
            ..ManifestJobConfig::new("data", "queue", "definition", "results", "out")
        }
    }

    #[tokio::test]
    async fn writes_a_row_per_object() {
        let store = Arc::new(MemoryStore::new());
        store.insert("data", "a.txt", Bytes::from_static(b"abc"));
        store.insert("data", "dir/b.txt", Bytes::from_static(b""));
        let results = Arc::new(MemoryMessageQueue::new("results"));
        results.send("stale").await.unwrap();
        let jobs = InlineWorkers {
            store: Arc::clone(&store),
            results: Arc::clone(&results),
            submitted: MemoryJobQueue::new(),
        };

        let started_at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        let report = run(
            store.as_ref(),
            &jobs,
            results.as_ref(),
            &config(),
            &started_at,
            &NullProgress,
        )
        .await
        .unwrap();

        assert_eq!(report.keys, 2);
        assert_eq!(report.submitted, 2);
        assert!(report.complete);
        assert_eq!(report.manifest_key, "manifest_data_03_05_24_14:07:09.tsv");
        assert_eq!(results.purges(), 1);

        let mut urls: Vec<_> = report.rows.iter().map(|r| r.url.as_str()).collect();
        urls.sort_unstable();
        assert_eq!(urls, vec!["s3://data/a.txt", "s3://data/dir/b.txt"]);

        let uploaded = store.object("out", &report.manifest_key).unwrap();
        let text = String::from_utf8(uploaded.to_vec()).unwrap();
        assert!(text.starts_with("url\tsize\tmd5\n"));
        assert!(text.contains("s3://data/a.txt\t3\t900150983cd24fb0d6963f7d28e17f72"));

        let submitted = jobs.submitted.submitted();
        assert!(submitted.iter().all(|j| j.job_name == METADATA_JOB_NAME));
        assert!(
            submitted
                .iter()
                .all(|j| j.environment[env::SQS_NAME] == "results")
        );
    }

    #[tokio::test]
    async fn missing_results_queue_is_fatal() {
        let store = MemoryStore::new();
        let jobs = MemoryJobQueue::new();
        let results = MemoryMessageQueue::missing("results");

        let err = run(
            &store,
            &jobs,
            &results,
            &config(),
            &Utc::now(),
            &NullProgress,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::Queue(ref e) if e.kind() == QueueFailure::NotFound
        ));
        assert_eq!(jobs.attempts(), 0);
    }

    #[tokio::test]
    async fn incomplete_drain_still_uploads_what_arrived() {
        let store = MemoryStore::new();
        store.insert("data", "a", Bytes::from_static(b"a"));
        store.insert("data", "b", Bytes::from_static(b"b"));
        let jobs = MemoryJobQueue::new();
        let results = MemoryMessageQueue::new("results");

        let report = run(
            &store,
            &jobs,
            &results,
            &config(),
            &Utc::now(),
            &NullProgress,
        )
        .await
        .unwrap();

        assert_eq!(report.submitted, 2);
        assert!(!report.complete);
        assert!(report.rows.is_empty());
        assert!(store.object("out", &report.manifest_key).is_some());
    }

    #[tokio::test]
    async fn permission_denied_stops_submission() {
        let store = MemoryStore::new();
        store.insert("data", "a", Bytes::from_static(b"a"));
        let jobs = MemoryJobQueue::new();
        jobs.fail_all(QueueFailure::PermissionDenied);
        let results = MemoryMessageQueue::new("results");

        let err = run(
            &store,
            &jobs,
            &results,
            &config(),
            &Utc::now(),
            &NullProgress,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DispatchError::PermissionDenied { .. }));
    }

    #[test]
    fn error_messages_become_error_rows() {
        let row = parse_message(r#"{"url":"s3://b/k","ERROR":"boom"}"#);
        assert_eq!(
            row,
            ObjectMetadata {
                url: "s3://b/k".to_string(),
                size: 0,
                md5: "boom".to_string(),
            }
        );

        let row = parse_message("not json");
        assert_eq!(row.size, 0);
        assert!(row.md5.starts_with("invalid message"));
    }
}
