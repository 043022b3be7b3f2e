#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Destination object storage.
//!
//! [`ObjectStore`] is the narrow set of S3 operations the replication and
//! bucket manifest jobs need: multipart uploads, `HeadObject`, paginated
//! listing, streamed `GetObject` and `PutObject`. [`S3Store`] implements it
//! with the AWS SDK; [`memory::MemoryStore`] implements it in memory.
//!
//! [`existence::check`] decides whether a destination object already
//! satisfies an expected size and checksum.
//!
//! # Credentials
//!
//! [`load_sdk_config`] uses the AWS default credential chain
//! (`AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`, profiles, instance
//! roles).

pub mod existence;
pub mod memory;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use replicator_models::{ChunkRange, PartCompletion};
use replicator_retry::Retryable;
use strum_macros::{AsRefStr, Display};

pub use existence::ExistenceCheck;
pub use s3::{S3Store, load_sdk_config};

/// Storage operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
pub enum Operation {
    /// `HeadObject`.
    HeadObject,
    /// `GetObject` (including reading the body).
    GetObject,
    /// `PutObject`.
    PutObject,
    /// `ListObjectsV2`.
    ListObjects,
    /// `CreateMultipartUpload`.
    CreateMultipartUpload,
    /// `UploadPart`.
    UploadPart,
    /// `CompleteMultipartUpload`.
    CompleteMultipartUpload,
    /// `AbortMultipartUpload`.
    AbortMultipartUpload,
}

/// Coarse classification of a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Throttling, timeouts, connection errors and 5xx responses.
    Transient,
    /// The credentials may not perform the operation.
    AccessDenied,
    /// The bucket, key or upload does not exist.
    NotFound,
    /// Anything else.
    Permanent,
}

impl FailureKind {
    /// Classifies a service error by its error code, falling back to the
    /// HTTP status.
    #[must_use]
    pub fn from_service(code: Option<&str>, status: u16) -> Self {
        match code {
            Some(
                "AccessDenied"
                | "AccessDeniedException"
                | "AllAccessDisabled"
                | "InvalidAccessKeyId"
                | "SignatureDoesNotMatch",
            ) => Self::AccessDenied,
            Some("NoSuchKey" | "NotFound" | "NoSuchBucket" | "NoSuchUpload") => Self::NotFound,
            Some(
                "SlowDown"
                | "Throttling"
                | "ThrottlingException"
                | "RequestTimeout"
                | "InternalError"
                | "ServiceUnavailable",
            ) => Self::Transient,
            _ => match status {
                403 => Self::AccessDenied,
                404 => Self::NotFound,
                408 | 429 | 500..=599 => Self::Transient,
                _ => Self::Permanent,
            },
        }
    }
}

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// An S3 request failed.
    #[error("{operation} failed for s3://{bucket}/{key} ({kind}): {source}")]
    Request {
        /// Failed operation.
        operation: Operation,
        /// Bucket name.
        bucket: String,
        /// Object key (or list prefix).
        key: String,
        /// Failure classification.
        kind: FailureKind,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A response lacked a field the protocol requires.
    #[error("{operation} for s3://{bucket}/{key} returned no {field}")]
    MissingField {
        /// Operation whose response was incomplete.
        operation: Operation,
        /// Bucket name.
        bucket: String,
        /// Object key.
        key: String,
        /// Missing field.
        field: &'static str,
    },

    /// A string is not an `s3://bucket/key` URL.
    #[error("Invalid S3 URL '{url}': expected s3://<bucket>/<key>")]
    InvalidUrl {
        /// The offending URL.
        url: String,
    },
}

impl StorageError {
    /// Classification of this error.
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Request { kind, .. } => *kind,
            Self::MissingField { .. } | Self::InvalidUrl { .. } => FailureKind::Permanent,
        }
    }

    /// Whether the credentials were refused.
    #[must_use]
    pub const fn is_access_denied(&self) -> bool {
        matches!(self.kind(), FailureKind::AccessDenied)
    }
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        matches!(self.kind(), FailureKind::Transient)
    }
}

/// Remote object metadata from `HeadObject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMeta {
    /// Content length in bytes.
    pub size: u64,
    /// `ETag`, quotes included as returned by the service.
    pub e_tag: Option<String>,
}

impl RemoteMeta {
    /// The `ETag` as an MD5 hex digest, if it is one.
    ///
    /// Single-part uploads have the content MD5 as `ETag`. Multipart
    /// `ETag`s contain a `-` (e.g. `"abc123-5"`) and are not comparable.
    #[must_use]
    pub fn md5(&self) -> Option<&str> {
        let clean = self.e_tag.as_deref()?.trim_matches('"');
        if !clean.contains('-') && clean.len() == 32 && clean.chars().all(|c| c.is_ascii_hexdigit())
        {
            Some(clean)
        } else {
            None
        }
    }
}

/// Streamed object body.
pub struct ObjectBody {
    /// Content length reported by the service.
    pub content_length: Option<u64>,
    /// Body chunks, in order.
    pub chunks: BoxStream<'static, Result<Bytes, StorageError>>,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Object storage operations used by the jobs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetches object metadata. `Ok(None)` means the object does not exist.
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<RemoteMeta>, StorageError>;

    /// Starts a multipart upload with the `bucket-owner-full-control` ACL
    /// and returns its upload id.
    async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String, StorageError>;

    /// Uploads one part and returns its `ETag`.
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StorageError>;

    /// Completes a multipart upload. `parts` must be sorted by part number.
    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartCompletion],
    ) -> Result<(), StorageError>;

    /// Aborts a multipart upload, discarding its parts.
    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError>;

    /// Lists every key in `bucket` under `prefix`, following pagination.
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Opens an object for streamed reading.
    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBody, StorageError>;

    /// Reads the bytes of `range` of an object. An empty range reads
    /// nothing.
    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: &ChunkRange,
    ) -> Result<Bytes, StorageError>;

    /// Writes a whole object.
    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError>;
}

/// An `s3://bucket/key` location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    /// Bucket name.
    pub bucket: String,
    /// Object key (may be empty for a bucket root).
    pub key: String,
}

impl S3Location {
    /// Parses `s3://bucket/key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidUrl`] if the scheme is not `s3://` or
    /// the bucket is empty.
    pub fn parse(url: &str) -> Result<Self, StorageError> {
        let rest = url
            .strip_prefix("s3://")
            .ok_or_else(|| StorageError::InvalidUrl {
                url: url.to_string(),
            })?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(StorageError::InvalidUrl {
                url: url.to_string(),
            });
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

impl std::fmt::Display for S3Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Decodes an object key that arrived form-encoded (`+` for space,
/// `%XX` escapes), as keys do in S3 event payloads.
///
/// Malformed escapes are kept verbatim.
#[must_use]
pub fn decode_key(raw: &str) -> String {
    percent_encoding::percent_decode_str(&raw.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}
