//! Fans a replication manifest out to the job queue.
//!
//! Every record goes through the same steps on a bounded pool of workers:
//!
//! 1. resolve the destination bucket from the project map;
//! 2. check that the object fits in one multipart upload;
//! 3. check whether the destination already holds the object;
//! 4. submit one transfer job, retrying throttled submissions.
//!
//! A refused credential stops the whole run. Every other failure only
//! marks its record [`JobOutcome::Failed`].

use std::sync::Arc;

use futures::stream::{self, StreamExt as _, TryStreamExt as _};
use replicator_bucket_map::BucketMapping;
use replicator_models::progress::ProgressCallback;
use replicator_models::{DispatchSummary, FileRecord, JobOutcome};
use replicator_queue::{JobQueue, JobRequest};
use replicator_retry::{RetryPolicy, retry};
use replicator_storage::ObjectStore;
use replicator_storage::existence::{ExistenceCheck, check};
use replicator_transfer::TransferJob;
use replicator_transfer::planner::{self, DEFAULT_CHUNK_SIZE, MIB};
use replicator_transfer::worker::env;

use crate::DispatchError;

/// Default number of records in flight.
pub const DEFAULT_WORKERS: usize = 16;

/// Job name of replication jobs.
pub const TRANSFER_JOB_NAME: &str = "gdc_copy";

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Records processed concurrently.
    pub workers: usize,
    /// Backoff for throttled or failed submissions.
    pub retry: RetryPolicy,
    /// Name given to submitted jobs.
    pub job_name: String,
    /// Job queue.
    pub job_queue: String,
    /// Job definition.
    pub job_definition: String,
    /// Source repository token passed to the workers.
    pub token: String,
    /// Part size the workers plan with, in MiB.
    pub chunk_size_mib: u64,
}

impl DispatchConfig {
    /// Default settings for the given queue, definition and token.
    #[must_use]
    pub fn new(job_queue: &str, job_definition: &str, token: &str) -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::submission(),
            job_name: TRANSFER_JOB_NAME.to_string(),
            job_queue: job_queue.to_string(),
            job_definition: job_definition.to_string(),
            token: token.to_string(),
            chunk_size_mib: DEFAULT_CHUNK_SIZE / MIB,
        }
    }

    /// Part size in bytes.
    #[must_use]
    pub const fn chunk_size(&self) -> u64 {
        self.chunk_size_mib.saturating_mul(MIB)
    }
}

/// Result of a dispatch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Outcome counts.
    pub summary: DispatchSummary,
    /// Every record with its outcome, in input order. Destination buckets
    /// are filled in where they could be resolved.
    pub outcomes: Vec<(FileRecord, JobOutcome)>,
}

/// Submits one job, retrying throttling and transient errors.
///
/// Returns `Ok(false)` if the job could not be submitted.
///
/// # Errors
///
/// Returns [`DispatchError::PermissionDenied`] if the job queue refused
/// the credentials.
pub(crate) async fn submit_with_retry(
    jobs: &dyn JobQueue,
    request: &JobRequest,
    policy: &RetryPolicy,
    label: &str,
) -> Result<bool, DispatchError> {
    match retry(policy, label, |_| jobs.submit(request)).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_permission_denied() => Err(DispatchError::PermissionDenied {
            job_queue: request.job_queue.clone(),
            source: e,
        }),
        Err(e) => {
            log::error!("Failed to submit {label}: {e}");
            Ok(false)
        }
    }
}

/// Replication job dispatcher.
pub struct Dispatcher {
    store: Arc<dyn ObjectStore>,
    jobs: Arc<dyn JobQueue>,
    mapping: BucketMapping,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        jobs: Arc<dyn JobQueue>,
        mapping: BucketMapping,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            jobs,
            mapping,
            config,
        }
    }

    /// Settings of this dispatcher.
    #[must_use]
    pub const fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Dispatches every record.
    ///
    /// `progress` counts records.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::PermissionDenied`] as soon as the job queue
    /// refuses our credentials; records still in flight are dropped.
    pub async fn dispatch(
        &self,
        records: Vec<FileRecord>,
        progress: &dyn ProgressCallback,
    ) -> Result<DispatchReport, DispatchError> {
        let total = records.len();
        progress.set_total(total as u64);
        log::info!(
            "Dispatching {total} records to {} ({} workers)",
            self.config.job_queue,
            self.config.workers
        );

        let mut outcomes: Vec<(usize, FileRecord, JobOutcome)> =
            stream::iter(records.into_iter().enumerate().map(|(i, record)| async move {
                let (record, outcome) = self.dispatch_one(record).await?;
                progress.inc(1);
                Ok::<_, DispatchError>((i, record, outcome))
            }))
            .buffer_unordered(self.config.workers.max(1))
            .try_collect()
            .await?;

        outcomes.sort_by_key(|(i, _, _)| *i);

        let mut summary = DispatchSummary::default();
        for (_, _, outcome) in &outcomes {
            summary.record(*outcome);
        }

        progress.finish(summary.to_string());
        log::info!("Dispatch finished: {summary}");

        Ok(DispatchReport {
            summary,
            outcomes: outcomes
                .into_iter()
                .map(|(_, record, outcome)| (record, outcome))
                .collect(),
        })
    }

    async fn dispatch_one(
        &self,
        mut record: FileRecord,
    ) -> Result<(FileRecord, JobOutcome), DispatchError> {
        let bucket = match self.mapping.resolve_record(&mut record) {
            Ok(bucket) => bucket.to_string(),
            Err(e) => {
                log::error!("{}: {e}", record.id);
                return Ok((record, JobOutcome::Failed));
            }
        };
        let key = record.object_key();

        if let Err(e) = planner::total_parts(record.size, self.config.chunk_size()) {
            log::error!("{}: {e}", record.id);
            return Ok((record, JobOutcome::Failed));
        }

        match check(
            self.store.as_ref(),
            &bucket,
            &key,
            record.size,
            record.md5.as_deref(),
        )
        .await
        {
            ExistenceCheck::Exists => {
                log::info!("s3://{bucket}/{key} already exists, skipping");
                return Ok((record, JobOutcome::Skipped));
            }
            ExistenceCheck::NotFound => {}
            ExistenceCheck::CheckError { message } => {
                log::warn!(
                    "Could not check s3://{bucket}/{key} ({message}), submitting anyway"
                );
            }
            mismatch => {
                log::warn!("s3://{bucket}/{key}: {mismatch}, replicating again");
            }
        }

        let Some(job) = TransferJob::for_record(&record, &self.config.token) else {
            return Ok((record, JobOutcome::Failed));
        };
        let mut environment = job.environment();
        environment.insert(
            env::CHUNK_SIZE_MIB.to_string(),
            self.config.chunk_size_mib.to_string(),
        );
        let request = JobRequest {
            job_name: self.config.job_name.clone(),
            job_queue: self.config.job_queue.clone(),
            job_definition: self.config.job_definition.clone(),
            environment,
        };

        let label = format!("{} ({key})", self.config.job_name);
        let outcome = if submit_with_retry(
            self.jobs.as_ref(),
            &request,
            &self.config.retry,
            &label,
        )
        .await?
        {
            log::debug!("Submitted {label}");
            JobOutcome::Submitted
        } else {
            JobOutcome::Failed
        };

        Ok((record, outcome))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bytes::Bytes;
    use replicator_bucket_map::ProjectBuckets;
    use replicator_models::Acl;
    use replicator_models::progress::NullProgress;
    use replicator_queue::QueueFailure;
    use replicator_queue::memory::MemoryJobQueue;
    use replicator_storage::memory::MemoryStore;
    use replicator_storage::{FailureKind, Operation};

    use super::*;

    fn mapping() -> BucketMapping {
        let mut projects = BTreeMap::new();
        projects.insert(
            "ALICE".to_string(),
            ProjectBuckets {
                aws_bucket_prefix: "test-gdc-xyz-phs000111".to_string(),
                gs_bucket_prefix: None,
            },
        );
        BucketMapping::new(projects, Vec::new(), Vec::new())
    }

    fn record(id: &str, size: u64, project_id: &str) -> FileRecord {
        FileRecord {
            id: id.to_string(),
            file_name: format!("{id}.bam"),
            size,
            md5: None,
            acl: Acl::Open,
            base_id: format!("base-{id}"),
            project_id: project_id.to_string(),
            source_url: format!("https://api/data/{id}"),
            destination_bucket: None,
        }
    }

    fn config() -> DispatchConfig {
        DispatchConfig {
            retry: RetryPolicy::immediate(3),
            ..DispatchConfig::new("queue", "definition", "token")
        }
    }

    const BUCKET: &str = "test-gdc-xyz-phs000111-2-open";

    fn dispatcher(store: &Arc<MemoryStore>, jobs: &Arc<MemoryJobQueue>) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(store) as Arc<dyn ObjectStore>,
            Arc::clone(jobs) as Arc<dyn JobQueue>,
            mapping(),
            config(),
        )
    }

    #[tokio::test]
    async fn skips_existing_and_submits_the_rest() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());

        let records: Vec<_> = (0..10).map(|i| record(&format!("g{i}"), 4, "ALICE")).collect();
        for r in records.iter().take(3) {
            store.insert(BUCKET, &r.object_key(), Bytes::from_static(b"abcd"));
        }

        let report = dispatcher(&store, &jobs)
            .dispatch(records, &NullProgress)
            .await
            .unwrap();

        assert_eq!(report.summary.skipped, 3);
        assert_eq!(report.summary.submitted + report.summary.failed, 7);
        assert_eq!(report.summary.total(), 10);
        assert_eq!(report.outcomes.len(), 10);
        assert_eq!(jobs.submitted().len(), 7);
    }

    #[tokio::test]
    async fn outcomes_keep_input_order_and_resolved_buckets() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let records = vec![record("a", 1, "ALICE"), record("b", 1, "ALICE")];

        let report = dispatcher(&store, &jobs)
            .dispatch(records, &NullProgress)
            .await
            .unwrap();

        let ids: Vec<_> = report.outcomes.iter().map(|(r, _)| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(
            report
                .outcomes
                .iter()
                .all(|(r, _)| r.destination_bucket.as_deref() == Some(BUCKET))
        );
    }

    #[tokio::test]
    async fn submitted_job_carries_the_transfer_environment() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());

        dispatcher(&store, &jobs)
            .dispatch(vec![record("g1", 1234, "ALICE")], &NullProgress)
            .await
            .unwrap();

        let submitted = jobs.submitted();
        assert_eq!(submitted.len(), 1);
        let job = &submitted[0];
        assert_eq!(job.job_name, "gdc_copy");
        assert_eq!(job.job_queue, "queue");
        assert_eq!(job.job_definition, "definition");
        assert_eq!(job.environment[env::ID], "g1");
        assert_eq!(job.environment[env::SIZE], "1234");
        assert_eq!(job.environment[env::DESTINATION_BUCKET], BUCKET);
        assert_eq!(job.environment[env::KEY], "g1/g1.bam");
        assert_eq!(job.environment[env::GDC_TOKEN], "token");
        assert_eq!(job.environment[env::CHUNK_SIZE_MIB], "100");
    }

    #[tokio::test]
    async fn object_needing_too_many_parts_fails_without_a_job() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let records = vec![
            record("huge", 10_000 * 100 * MIB + 1, "ALICE"),
            record("limit", 10_000 * 100 * MIB, "ALICE"),
        ];

        let report = dispatcher(&store, &jobs)
            .dispatch(records, &NullProgress)
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].1, JobOutcome::Failed);
        assert_eq!(report.outcomes[1].1, JobOutcome::Submitted);
        assert_eq!(jobs.submitted().len(), 1);
        assert_eq!(jobs.submitted()[0].environment[env::ID], "limit");
        assert_eq!(store.calls(Operation::HeadObject), 1);
    }

    #[tokio::test]
    async fn chunk_size_below_the_minimum_fails_every_record() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let config = DispatchConfig {
            chunk_size_mib: 4,
            ..config()
        };
        let dispatcher = Dispatcher::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            Arc::clone(&jobs) as Arc<dyn JobQueue>,
            mapping(),
            config,
        );

        let report = dispatcher
            .dispatch(vec![record("a", 1, "ALICE")], &NullProgress)
            .await
            .unwrap();

        assert_eq!(report.summary.failed, 1);
        assert!(jobs.submitted().is_empty());
    }

    #[tokio::test]
    async fn failed_existence_check_still_submits() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let r = record("a", 4, "ALICE");
        store.insert(BUCKET, &r.object_key(), Bytes::from_static(b"abcd"));
        store.fail_next(Operation::HeadObject, FailureKind::Transient, 1);

        let report = dispatcher(&store, &jobs)
            .dispatch(vec![r], &NullProgress)
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].1, JobOutcome::Submitted);
        assert_eq!(jobs.submitted().len(), 1);
    }

    #[tokio::test]
    async fn denied_existence_check_still_submits() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        store.fail_next(Operation::HeadObject, FailureKind::AccessDenied, 1);

        let report = dispatcher(&store, &jobs)
            .dispatch(vec![record("a", 4, "ALICE")], &NullProgress)
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].1, JobOutcome::Submitted);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_replicated_again() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let mut r = record("a", 3, "ALICE");
        // md5("abc"); the stored object is "xyz" of the same size.
        r.md5 = Some("900150983cd24fb0d6963f7d28e17f72".to_string());
        store.insert(BUCKET, &r.object_key(), Bytes::from_static(b"xyz"));

        let report = dispatcher(&store, &jobs)
            .dispatch(vec![r], &NullProgress)
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].1, JobOutcome::Submitted);
        assert_eq!(jobs.submitted().len(), 1);
    }

    #[tokio::test]
    async fn matching_checksum_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let mut r = record("a", 3, "ALICE");
        r.md5 = Some("900150983cd24fb0d6963f7d28e17f72".to_string());
        store.insert(BUCKET, &r.object_key(), Bytes::from_static(b"abc"));

        let report = dispatcher(&store, &jobs)
            .dispatch(vec![r], &NullProgress)
            .await
            .unwrap();

        assert_eq!(report.outcomes[0].1, JobOutcome::Skipped);
        assert!(jobs.submitted().is_empty());
    }

    #[tokio::test]
    async fn unknown_project_fails_only_its_record() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let records = vec![record("a", 1, "ALICE"), record("b", 1, "NOBODY")];

        let report = dispatcher(&store, &jobs)
            .dispatch(records, &NullProgress)
            .await
            .unwrap();

        assert_eq!(report.summary.submitted, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.outcomes[1].1, JobOutcome::Failed);
        assert!(report.outcomes[1].0.destination_bucket.is_none());
    }

    #[tokio::test]
    async fn size_mismatch_is_replicated_again() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        let r = record("a", 10, "ALICE");
        store.insert(BUCKET, &r.object_key(), Bytes::from_static(b"short"));

        let report = dispatcher(&store, &jobs)
            .dispatch(vec![r], &NullProgress)
            .await
            .unwrap();

        assert_eq!(report.summary.submitted, 1);
    }

    #[tokio::test]
    async fn throttled_submission_is_retried() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        jobs.fail_job(env::ID, "a", QueueFailure::Throttled, 2);

        let report = dispatcher(&store, &jobs)
            .dispatch(vec![record("a", 1, "ALICE")], &NullProgress)
            .await
            .unwrap();

        assert_eq!(report.summary.submitted, 1);
        assert_eq!(jobs.attempts(), 3);
    }

    #[tokio::test]
    async fn exhausted_or_rejected_submissions_fail_the_record() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        jobs.fail_job(env::ID, "a", QueueFailure::Throttled, 10);
        jobs.fail_job(env::ID, "b", QueueFailure::Rejected, 10);
        let records = vec![
            record("a", 1, "ALICE"),
            record("b", 1, "ALICE"),
            record("c", 1, "ALICE"),
        ];

        let report = dispatcher(&store, &jobs)
            .dispatch(records, &NullProgress)
            .await
            .unwrap();

        assert_eq!(report.summary.failed, 2);
        assert_eq!(report.summary.submitted, 1);
        // 3 attempts for the throttled job, 1 for the rejected one, 1 for c.
        assert_eq!(jobs.attempts(), 5);
    }

    #[tokio::test]
    async fn permission_denied_stops_the_run() {
        let store = Arc::new(MemoryStore::new());
        let jobs = Arc::new(MemoryJobQueue::new());
        jobs.fail_all(QueueFailure::PermissionDenied);

        let err = dispatcher(&store, &jobs)
            .dispatch(vec![record("a", 1, "ALICE")], &NullProgress)
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::PermissionDenied { .. }));
        assert_eq!(jobs.attempts(), 1);
    }
}
