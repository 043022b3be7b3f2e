//! Ranged reads from the source of a transfer.
//!
//! The data repository serves each object at `<endpoint>/<id>` and honours
//! `Range: bytes=<start>-<end>` requests authenticated with an
//! `X-Auth-Token` header. Bucket to bucket copies read ranges of the
//! source object through an [`ObjectStore`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use replicator_models::ChunkRange;
use replicator_retry::Retryable;
use replicator_storage::{ObjectStore, StorageError};

/// Header carrying the source repository token.
pub const AUTH_HEADER: &str = "X-Auth-Token";

/// Errors returned by a [`RangeSource`].
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The request could not be sent or the body could not be read.
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        /// Requested URL.
        url: String,
        /// Underlying client error.
        source: reqwest::Error,
    },

    /// The server answered with an unexpected status.
    #[error("{url} returned HTTP {status} for {range}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
        /// Requested range header.
        range: String,
    },

    /// Reading from object storage failed.
    #[error(transparent)]
    Store(#[from] StorageError),
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http { source, .. } => is_transient(source),
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::Store(e) => e.is_retryable(),
        }
    }
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}

/// A readable object of known size.
#[async_trait]
pub trait RangeSource: Send + Sync {
    /// Object size in bytes.
    fn size(&self) -> u64;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Reads the bytes of `range`. Never called for empty ranges.
    async fn fetch(&self, range: &ChunkRange) -> Result<Bytes, SourceError>;
}

/// Where to read an object from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// Download URL.
    pub url: String,
    /// Source repository token, if the object is access controlled.
    pub token: Option<String>,
    /// Object size in bytes.
    pub size: u64,
}

impl SourceDescriptor {
    /// Descriptor for object `id` under a data endpoint such as
    /// `https://api.gdc.cancer.gov/data/`.
    #[must_use]
    pub fn for_id(endpoint: &str, id: &str, token: Option<String>, size: u64) -> Self {
        Self {
            url: format!("{}/{id}", endpoint.trim_end_matches('/')),
            token: token.filter(|t| !t.is_empty()),
            size,
        }
    }
}

/// [`RangeSource`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRangeSource {
    client: reqwest::Client,
    descriptor: SourceDescriptor,
}

impl HttpRangeSource {
    /// Creates a source reading `descriptor` through `client`.
    #[must_use]
    pub const fn new(client: reqwest::Client, descriptor: SourceDescriptor) -> Self {
        Self { client, descriptor }
    }
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    fn size(&self) -> u64 {
        self.descriptor.size
    }

    fn describe(&self) -> String {
        self.descriptor.url.clone()
    }

    async fn fetch(&self, range: &ChunkRange) -> Result<Bytes, SourceError> {
        let url = &self.descriptor.url;
        let header = range.range_header().unwrap_or_default();

        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::RANGE, &header);
        if let Some(token) = &self.descriptor.token {
            request = request.header(AUTH_HEADER, token);
        }

        let response = request.send().await.map_err(|source| SourceError::Http {
            url: url.clone(),
            source,
        })?;

        // A server may ignore the range and send the whole object, which is
        // only usable when the range was the whole object anyway.
        let status = response.status();
        let whole_object = range.start == 0 && range.length == self.descriptor.size;
        let acceptable = status == reqwest::StatusCode::PARTIAL_CONTENT
            || (status == reqwest::StatusCode::OK && whole_object);
        if !acceptable {
            return Err(SourceError::Status {
                url: url.clone(),
                status: status.as_u16(),
                range: header,
            });
        }

        log::debug!("Downloading {header} of {url} (part {})", range.part_number);

        response.bytes().await.map_err(|source| SourceError::Http {
            url: url.clone(),
            source,
        })
    }
}

/// [`RangeSource`] over an object in a bucket.
pub struct StoreRangeSource {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
    size: u64,
}

impl StoreRangeSource {
    /// Creates a source reading `s3://bucket/key` of `size` bytes.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, bucket: &str, key: &str, size: u64) -> Self {
        Self {
            store,
            bucket: bucket.to_string(),
            key: key.to_string(),
            size,
        }
    }
}

#[async_trait]
impl RangeSource for StoreRangeSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    async fn fetch(&self, range: &ChunkRange) -> Result<Bytes, SourceError> {
        log::debug!(
            "Reading part {} of s3://{}/{}",
            range.part_number,
            self.bucket,
            self.key
        );
        Ok(self.store.get_range(&self.bucket, &self.key, range).await?)
    }
}
