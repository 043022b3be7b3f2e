#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Tab-separated manifest files.
//!
//! * [`replication`] reads the replication input manifest into validated
//!   [`replicator_models::FileRecord`]s and writes the per-outcome output
//!   manifests of a dispatch run.
//! * [`bucket`] writes the `url, size, md5` manifest produced by the
//!   bucket manifest job.
//! * [`copy`] reads the `project_id, url` manifest of a bucket copy run.

pub mod bucket;
pub mod copy;
pub mod replication;

/// Errors that can occur while reading or writing manifests.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// CSV/TSV encoding or decoding error.
    #[error("TSV error in {path}: {source}")]
    Csv {
        /// Manifest path (or `<memory>`).
        path: String,
        /// Underlying CSV error.
        source: csv::Error,
    },

    /// I/O error reading or writing a manifest.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Manifest path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A required column is missing from the header row.
    #[error("Manifest {path} is missing required column '{column}'")]
    MissingColumn {
        /// Manifest path (or `<memory>`).
        path: String,
        /// Name of the missing column.
        column: String,
    },
}

/// Label used in errors for manifests that do not come from a file.
pub(crate) const MEMORY_PATH: &str = "<memory>";
