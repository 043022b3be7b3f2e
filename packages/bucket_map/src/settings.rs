//! Job settings file.
//!
//! The deployment mounts a JSON credentials document next to the project
//! map. Only the keys used by the replication jobs are read; everything
//! else in the document is ignored.

use std::path::Path;

use serde::Deserialize;

use crate::BucketMapError;

/// Settings shared by the replication driver and its transfer workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Settings {
    /// Token sent to the source repository with every ranged download.
    #[serde(rename = "GDC_TOKEN", default)]
    pub source_token: String,
    /// Bucket prefixes using `-open` / `-controlled`.
    #[serde(rename = "POSTFIX_1_EXCEPTION", default)]
    pub postfix_1_exceptions: Vec<String>,
    /// Bucket prefixes using `-2-open` / `-2-controlled`.
    #[serde(rename = "POSTFIX_2_EXCEPTION", default)]
    pub postfix_2_exceptions: Vec<String>,
}

impl Settings {
    /// Loads settings from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`BucketMapError`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, BucketMapError> {
        let json = std::fs::read_to_string(path).map_err(|source| BucketMapError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| BucketMapError::Json {
            path: path.display().to_string(),
            source,
        })
    }
}
