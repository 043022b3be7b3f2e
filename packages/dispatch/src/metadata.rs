//! Object metadata worker.
//!
//! Worker side of the bucket manifest job: streams one object, computes
//! its MD5 and size, and publishes the result to the results queue.

use std::collections::BTreeMap;

use futures::StreamExt as _;
use replicator_models::{MetadataMessage, ObjectMetadata};
use replicator_queue::MessageQueue;
use replicator_retry::{RetryPolicy, retry};
use replicator_storage::{ObjectStore, StorageError, decode_key};

use crate::DispatchError;

/// Environment variable names of a metadata job.
pub mod env {
    /// Bucket holding the object.
    pub const BUCKET: &str = "BUCKET";
    /// Object key, possibly form-encoded.
    pub const KEY: &str = "KEY";
    /// Results queue name or URL.
    pub const SQS_NAME: &str = "SQS_NAME";
}

/// Error text sent when the object may not be read.
pub const ACCESS_DENIED: &str = "AccessDeniedException";

/// Parameters of one metadata job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataJob {
    /// Bucket holding the object.
    pub bucket: String,
    /// Object key as listed.
    pub key: String,
    /// Results queue name or URL.
    pub queue: String,
}

impl MetadataJob {
    /// Environment overrides passed to the job queue.
    #[must_use]
    pub fn environment(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (env::BUCKET.to_string(), self.bucket.clone()),
            (env::KEY.to_string(), self.key.clone()),
            (env::SQS_NAME.to_string(), self.queue.clone()),
        ])
    }
}

/// Streams `s3://bucket/key` and computes its MD5 and size.
///
/// The body is hashed chunk by chunk as it arrives.
///
/// # Errors
///
/// Returns [`StorageError`] if the object cannot be opened or read.
pub async fn compute(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
) -> Result<ObjectMetadata, StorageError> {
    let mut body = store.get(bucket, key).await?;
    let mut context = md5::Context::new();
    let mut size = 0u64;

    while let Some(chunk) = body.chunks.next().await {
        let chunk = chunk?;
        context.consume(&chunk);
        size += chunk.len() as u64;
    }

    Ok(ObjectMetadata {
        url: format!("s3://{bucket}/{key}"),
        size,
        md5: format!("{:x}", context.finalize()),
    })
}

/// Runs one metadata job and publishes its result.
///
/// The key is form-decoded first. Transient read failures are retried
/// with `policy`; an access denial is reported without retrying.
/// Publishing is retried with the same policy.
///
/// Returns the message that was sent.
///
/// # Errors
///
/// Returns [`DispatchError`] if the message cannot be encoded or sent.
pub async fn run(
    store: &dyn ObjectStore,
    queue: &dyn MessageQueue,
    bucket: &str,
    raw_key: &str,
    policy: &RetryPolicy,
) -> Result<MetadataMessage, DispatchError> {
    let key = decode_key(raw_key);
    let url = format!("s3://{bucket}/{key}");
    log::info!("Computing metadata of {url}");

    let message = match retry(policy, &url, |_| compute(store, bucket, &key)).await {
        Ok(metadata) => {
            log::info!("{url}: {} bytes, md5 {}", metadata.size, metadata.md5);
            MetadataMessage::success(metadata.url, metadata.md5, metadata.size)
        }
        Err(e) if e.is_access_denied() => {
            log::error!("Access denied reading {url}: {e}");
            MetadataMessage::failure(None, ACCESS_DENIED.to_string())
        }
        Err(e) => {
            log::error!("Failed to read {url}: {e}");
            MetadataMessage::failure(Some(url.clone()), e.to_string())
        }
    };

    let body = serde_json::to_string(&message)?;
    retry(policy, "send metadata message", |_| queue.send(&body)).await?;
    log::debug!("Sent {body} to {}", queue.name());

    Ok(message)
}
