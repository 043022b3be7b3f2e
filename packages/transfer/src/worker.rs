//! Worker side of a replication job.
//!
//! The dispatcher submits one job per object with the parameters of a
//! [`TransferJob`] as environment variables; the worker reads them back
//! and runs the [`MultipartTransfer`] engine against the source
//! repository.

use std::collections::BTreeMap;

use replicator_models::progress::ProgressCallback;
use replicator_models::{FileRecord, PartCompletion};

use crate::engine::{MultipartTransfer, TransferError};
use crate::source::{HttpRangeSource, SourceDescriptor};

/// Data endpoint of the source repository.
pub const DEFAULT_DATA_ENDPOINT: &str = "https://api.gdc.cancer.gov/data/";

/// Environment variable names of a transfer job.
pub mod env {
    /// Object id.
    pub const ID: &str = "ID";
    /// File name.
    pub const FILE_NAME: &str = "FILE_NAME";
    /// Object size in bytes.
    pub const SIZE: &str = "SIZE";
    /// Destination bucket.
    pub const DESTINATION_BUCKET: &str = "DESTINATION_BUCKET";
    /// Destination key.
    pub const KEY: &str = "KEY";
    /// Source repository token.
    pub const GDC_TOKEN: &str = "GDC_TOKEN";
    /// Part size in MiB.
    pub const CHUNK_SIZE_MIB: &str = "CHUNK_SIZE_MIB";
}

/// Parameters of one replication job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    /// Object id in the source repository.
    pub id: String,
    /// File name.
    pub file_name: String,
    /// Object size in bytes.
    pub size: u64,
    /// Destination bucket.
    pub destination_bucket: String,
    /// Destination key (`<id>/<file_name>`).
    pub key: String,
    /// Source repository token.
    pub token: String,
}

impl TransferJob {
    /// Job for a record whose destination bucket is resolved.
    ///
    /// Returns `None` if the bucket has not been resolved.
    #[must_use]
    pub fn for_record(record: &FileRecord, token: &str) -> Option<Self> {
        Some(Self {
            id: record.id.clone(),
            file_name: record.file_name.clone(),
            size: record.size,
            destination_bucket: record.destination_bucket.clone()?,
            key: record.object_key(),
            token: token.to_string(),
        })
    }

    /// Environment overrides passed to the job queue.
    #[must_use]
    pub fn environment(&self) -> BTreeMap<String, String> {
        [
            (env::ID, self.id.clone()),
            (env::FILE_NAME, self.file_name.clone()),
            (env::SIZE, self.size.to_string()),
            (env::DESTINATION_BUCKET, self.destination_bucket.clone()),
            (env::KEY, self.key.clone()),
            (env::GDC_TOKEN, self.token.clone()),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }

    /// Source descriptor of this job's object.
    #[must_use]
    pub fn source(&self, endpoint: &str) -> SourceDescriptor {
        SourceDescriptor::for_id(endpoint, &self.id, Some(self.token.clone()), self.size)
    }
}

/// Runs one replication job.
///
/// # Errors
///
/// Returns [`TransferError`] if the transfer fails.
pub async fn run(
    job: &TransferJob,
    endpoint: &str,
    client: reqwest::Client,
    engine: &MultipartTransfer,
    progress: &dyn ProgressCallback,
) -> Result<Vec<PartCompletion>, TransferError> {
    log::info!(
        "Replicating {} ({}, {} bytes) to s3://{}/{}",
        job.id,
        job.file_name,
        job.size,
        job.destination_bucket,
        job.key
    );

    let source = HttpRangeSource::new(client, job.source(endpoint));
    engine
        .transfer(&source, &job.destination_bucket, &job.key, progress)
        .await
}

#[cfg(test)]
mod tests {
    use replicator_models::Acl;

    use super::*;

    fn record() -> FileRecord {
        FileRecord {
            id: "guid-1".to_string(),
            file_name: "a.bam".to_string(),
            size: 1234,
            md5: None,
            acl: Acl::Open,
            base_id: "base".to_string(),
            project_id: "ALICE".to_string(),
            source_url: String::new(),
            destination_bucket: Some("bucket-2-open".to_string()),
        }
    }

    #[test]
    fn environment_carries_every_parameter() {
        let job = TransferJob::for_record(&record(), "token").unwrap();
        let vars = job.environment();

        assert_eq!(vars.len(), 6);
        assert_eq!(vars[env::ID], "guid-1");
        assert_eq!(vars[env::FILE_NAME], "a.bam");
        assert_eq!(vars[env::SIZE], "1234");
        assert_eq!(vars[env::DESTINATION_BUCKET], "bucket-2-open");
        assert_eq!(vars[env::KEY], "guid-1/a.bam");
        assert_eq!(vars[env::GDC_TOKEN], "token");
    }

    #[test]
    fn unresolved_record_has_no_job() {
        let mut record = record();
        record.destination_bucket = None;
        assert!(TransferJob::for_record(&record, "token").is_none());
    }

    #[test]
    fn source_url_comes_from_the_endpoint() {
        let job = TransferJob::for_record(&record(), "token").unwrap();
        let source = job.source(DEFAULT_DATA_ENDPOINT);
        assert_eq!(source.url, "https://api.gdc.cancer.gov/data/guid-1");
        assert_eq!(source.token.as_deref(), Some("token"));
        assert_eq!(source.size, 1234);
    }
}
