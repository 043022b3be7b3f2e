//! [`ObjectStore`] backed by the AWS SDK.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::config::StalledStreamProtectionConfig;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ObjectCannedAcl};
use bytes::Bytes;
use futures::StreamExt as _;
use replicator_models::{ChunkRange, PartCompletion};

use crate::{FailureKind, ObjectBody, ObjectStore, Operation, RemoteMeta, StorageError};

/// Loads the shared AWS configuration from the default provider chain.
///
/// `region` overrides the region from the environment/profile.
pub async fn load_sdk_config(region: Option<&str>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_string()));
    }
    loader.load().await
}

/// S3 client.
#[derive(Debug, Clone)]
pub struct S3Store {
    client: aws_sdk_s3::Client,
}

impl S3Store {
    /// Creates a store from a loaded SDK configuration.
    ///
    /// Stalled stream protection is disabled for large part uploads.
    #[must_use]
    pub fn new(config: &SdkConfig) -> Self {
        let s3_config = aws_sdk_s3::config::Builder::from(config)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .build();
        Self {
            client: aws_sdk_s3::Client::from_conf(s3_config),
        }
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn from_client(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

/// Classifies an SDK error.
fn classify<E: ProvideErrorMetadata>(err: &SdkError<E, HttpResponse>) -> FailureKind {
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            FailureKind::Transient
        }
        SdkError::ServiceError(service) => {
            FailureKind::from_service(service.err().code(), service.raw().status().as_u16())
        }
        _ => FailureKind::Permanent,
    }
}

fn request_error<E>(
    operation: Operation,
    bucket: &str,
    key: &str,
    err: SdkError<E, HttpResponse>,
) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    StorageError::Request {
        operation,
        bucket: bucket.to_string(),
        key: key.to_string(),
        kind: classify(&err),
        source: Box::new(err),
    }
}

fn to_i32(part_number: u32) -> i32 {
    i32::try_from(part_number).unwrap_or(i32::MAX)
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<RemoteMeta>, StorageError> {
        let result = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let size = output.content_length().unwrap_or(0);
                #[allow(clippy::cast_sign_loss)] // S3 content-length is non-negative
                let size = size as u64;
                Ok(Some(RemoteMeta {
                    size,
                    e_tag: output.e_tag().map(str::to_string),
                }))
            }
            Err(err) => {
                // NotFound means the object doesn't exist
                if err
                    .as_service_error()
                    .is_some_and(aws_sdk_s3::operation::head_object::HeadObjectError::is_not_found)
                {
                    return Ok(None);
                }
                Err(request_error(Operation::HeadObject, bucket, key, err))
            }
        }
    }

    async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String, StorageError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .acl(ObjectCannedAcl::BucketOwnerFullControl)
            .send()
            .await
            .map_err(|e| request_error(Operation::CreateMultipartUpload, bucket, key, e))?;

        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| StorageError::MissingField {
                operation: Operation::CreateMultipartUpload,
                bucket: bucket.to_string(),
                key: key.to_string(),
                field: "UploadId",
            })
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StorageError> {
        #[allow(clippy::cast_possible_wrap)] // parts are at most a few GiB
        let length = body.len() as i64;

        let output = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(to_i32(part_number))
            .content_length(length)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| request_error(Operation::UploadPart, bucket, key, e))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StorageError::MissingField {
                operation: Operation::UploadPart,
                bucket: bucket.to_string(),
                key: key.to_string(),
                field: "ETag",
            })
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartCompletion],
    ) -> Result<(), StorageError> {
        let completed: Vec<CompletedPart> = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(to_i32(p.part_number))
                    .e_tag(&p.e_tag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| request_error(Operation::CompleteMultipartUpload, bucket, key, e))?;

        Ok(())
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| request_error(Operation::AbortMultipartUpload, bucket, key, e))?;

        Ok(())
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        log::info!("Listing s3://{bucket}/{prefix}*");

        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self.client.list_objects_v2().bucket(bucket);

            if !prefix.is_empty() {
                request = request.prefix(prefix);
            }
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|e| request_error(Operation::ListObjects, bucket, prefix, e))?;

            for obj in output.contents() {
                if let Some(key) = obj.key() {
                    keys.push(key.to_string());
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        log::info!("  found {} objects", keys.len());
        Ok(keys)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBody, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| request_error(Operation::GetObject, bucket, key, e))?;

        let content_length = output.content_length().and_then(|l| u64::try_from(l).ok());
        let bucket = bucket.to_string();
        let key = key.to_string();

        let chunks = futures::stream::unfold(Some(output.body), move |body| {
            let bucket = bucket.clone();
            let key = key.clone();
            async move {
                let mut body = body?;
                match body.next().await? {
                    Ok(bytes) => Some((Ok(bytes), Some(body))),
                    Err(e) => Some((
                        Err(StorageError::Request {
                            operation: Operation::GetObject,
                            bucket,
                            key,
                            kind: FailureKind::Transient,
                            source: Box::new(e),
                        }),
                        None,
                    )),
                }
            }
        })
        .boxed();

        Ok(ObjectBody {
            content_length,
            chunks,
        })
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: &ChunkRange,
    ) -> Result<Bytes, StorageError> {
        let Some(end) = range.end() else {
            return Ok(Bytes::new());
        };

        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .range(format!("bytes={}-{end}", range.start))
            .send()
            .await
            .map_err(|e| request_error(Operation::GetObject, bucket, key, e))?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::Request {
                operation: Operation::GetObject,
                bucket: bucket.to_string(),
                key: key.to_string(),
                kind: FailureKind::Transient,
                source: Box::new(e),
            })?;
        Ok(body.into_bytes())
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError> {
        #[allow(clippy::cast_precision_loss)] // display-only MB value
        let mb = body.len() as f64 / 1_048_576.0;
        log::info!("Pushing s3://{bucket}/{key} ({mb:.1} MB)");

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| request_error(Operation::PutObject, bucket, key, e))?;

        log::info!("  uploaded {key}");
        Ok(())
    }
}
