#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Job and message queues.
//!
//! * [`JobQueue`] submits named jobs with environment overrides
//!   ([`batch::BatchJobQueue`] for AWS Batch).
//! * [`MessageQueue`] carries worker results back to the driver
//!   ([`sqs::SqsQueue`] for SQS), drained with [`drain::drain`].
//!
//! Both classify failures into a [`QueueFailure`] so callers can tell a
//! refused credential (fatal to the whole run) from throttling (retry).

pub mod batch;
pub mod drain;
pub mod memory;
pub mod sqs;

use std::collections::BTreeMap;

use async_trait::async_trait;
use aws_sdk_batch::config::http::HttpResponse;
use aws_sdk_batch::error::{ProvideErrorMetadata, SdkError};
use replicator_retry::Retryable;
use strum_macros::Display;

pub use batch::BatchJobQueue;
pub use drain::{DrainOutcome, drain};
pub use sqs::SqsQueue;

/// Classification of a failed queue request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum QueueFailure {
    /// The credentials may not use the queue.
    PermissionDenied,
    /// The service asked us to slow down.
    Throttled,
    /// The queue does not exist.
    NotFound,
    /// The request itself is invalid (unknown job definition, ...).
    Rejected,
    /// Timeouts, connection errors and server errors.
    Transient,
}

impl QueueFailure {
    /// Classifies a service error by its error code, falling back to the
    /// HTTP status.
    #[must_use]
    pub fn from_service(code: Option<&str>, status: u16) -> Self {
        match code {
            Some("AccessDeniedException" | "AccessDenied") => Self::PermissionDenied,
            Some(
                "TooManyRequestsException"
                | "ThrottlingException"
                | "RequestThrottled"
                | "Throttling",
            ) => Self::Throttled,
            Some("AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist") => {
                Self::NotFound
            }
            Some("ClientException" | "InvalidParameterValue" | "InvalidParameterValueException") => {
                Self::Rejected
            }
            Some("ServerException" | "ServiceUnavailable" | "InternalFailure") => Self::Transient,
            _ => match status {
                401 | 403 => Self::PermissionDenied,
                429 => Self::Throttled,
                408 | 500..=599 => Self::Transient,
                _ => Self::Rejected,
            },
        }
    }
}

/// Classifies an SDK error.
pub(crate) fn classify<E: ProvideErrorMetadata>(err: &SdkError<E, HttpResponse>) -> QueueFailure {
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            QueueFailure::Transient
        }
        SdkError::ServiceError(service) => {
            QueueFailure::from_service(service.err().code(), service.raw().status().as_u16())
        }
        _ => QueueFailure::Rejected,
    }
}

/// Errors that can occur during queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// A queue request failed.
    #[error("{operation} on {target} failed ({kind}): {source}")]
    Request {
        /// Failed operation (`SubmitJob`, `ReceiveMessage`, ...).
        operation: &'static str,
        /// Job queue or message queue.
        target: String,
        /// Failure classification.
        kind: QueueFailure,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A response lacked a field the protocol requires.
    #[error("{operation} on {target} returned no {field}")]
    MissingField {
        /// Operation whose response was incomplete.
        operation: &'static str,
        /// Job queue or message queue.
        target: String,
        /// Missing field.
        field: &'static str,
    },
}

impl QueueError {
    pub(crate) fn from_sdk<E>(
        operation: &'static str,
        target: &str,
        err: SdkError<E, HttpResponse>,
    ) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        Self::Request {
            operation,
            target: target.to_string(),
            kind: classify(&err),
            source: Box::new(err),
        }
    }

    /// Classification of this error.
    #[must_use]
    pub const fn kind(&self) -> QueueFailure {
        match self {
            Self::Request { kind, .. } => *kind,
            Self::MissingField { .. } => QueueFailure::Transient,
        }
    }

    /// Whether the whole run must stop.
    #[must_use]
    pub const fn is_permission_denied(&self) -> bool {
        matches!(self.kind(), QueueFailure::PermissionDenied)
    }
}

impl Retryable for QueueError {
    fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            QueueFailure::Throttled | QueueFailure::Transient
        )
    }
}

/// One job submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Job name (`gdc_copy`, `bucket_manifest`).
    pub job_name: String,
    /// Job queue.
    pub job_queue: String,
    /// Job definition.
    pub job_definition: String,
    /// Environment overrides of the job's container.
    pub environment: BTreeMap<String, String>,
}

/// A batch job service.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submits one job. Returns once the service accepted it.
    async fn submit(&self, request: &JobRequest) -> Result<(), QueueError>;
}

/// A message received from a [`MessageQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Message body.
    pub body: String,
    /// Handle used to delete the message.
    pub receipt_handle: String,
}

/// A message queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Queue name or URL, for logs.
    fn name(&self) -> &str;

    /// Sends one message.
    async fn send(&self, body: &str) -> Result<(), QueueError>;

    /// Receives at most one message without waiting and without hiding it
    /// from other consumers.
    async fn receive(&self) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Deletes a received message.
    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;

    /// Deletes every message in the queue.
    async fn purge(&self) -> Result<(), QueueError>;
}
