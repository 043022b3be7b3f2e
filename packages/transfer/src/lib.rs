#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Chunked multipart replication of one large object.
//!
//! * [`planner`] splits an object into byte ranges that satisfy the S3
//!   multipart limits (5 MiB minimum part, 10 000 parts).
//! * [`source`] reads ranges from the source repository over HTTP.
//! * [`engine`] drives create → upload parts → complete, aborting the
//!   upload on any failure.
//! * [`worker`] is the entry point of a replication job.

pub mod engine;
pub mod planner;
pub mod source;
pub mod worker;

pub use engine::{MultipartTransfer, TransferConfig, TransferError};
pub use planner::{PlanError, plan, total_parts};
pub use source::{HttpRangeSource, RangeSource, SourceDescriptor, SourceError, StoreRangeSource};
pub use worker::TransferJob;
