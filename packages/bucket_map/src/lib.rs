#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Destination bucket resolution.
//!
//! Every project has a bucket prefix in the project map. The final bucket
//! name depends on whether the file is open or controlled access, and on
//! two exception lists from the job settings:
//!
//! | Prefix in | Open | Controlled |
//! |---|---|---|
//! | neither list | `<prefix>-2-open` | `<prefix>-controlled` |
//! | postfix-1 exceptions | `<prefix>-open` | `<prefix>-controlled` |
//! | postfix-2 exceptions | `<prefix>-2-open` | `<prefix>-2-controlled` |
//!
//! The TARGET program has fixed bucket names regardless of the lists.

pub mod settings;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use replicator_models::{Acl, FileRecord};
use serde::{Deserialize, Serialize};

pub use settings::Settings;

/// Open bucket of the TARGET program.
pub const TARGET_OPEN_BUCKET: &str = "gdc-target-phs000218-2-open";

/// Controlled bucket of the TARGET program.
pub const TARGET_CONTROLLED_BUCKET: &str = "target-controlled";

/// Substring identifying TARGET program prefixes.
const TARGET_MARKER: &str = "target";

/// Errors raised while resolving a destination bucket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The project is missing from the project map.
    #[error("Project ID {project_id} not found in the mapping ({available} projects available)")]
    UnknownProject {
        /// The unmapped project.
        project_id: String,
        /// Number of projects in the map.
        available: usize,
    },
}

/// Errors raised while loading the project map or settings.
#[derive(Debug, thiserror::Error)]
pub enum BucketMapError {
    /// Reading a file failed.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The file is not valid JSON for the expected shape.
    #[error("Failed to parse {path}: {source}")]
    Json {
        /// File path.
        path: String,
        /// Underlying parse error.
        source: serde_json::Error,
    },
}

/// Bucket prefixes of one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectBuckets {
    /// Prefix of the AWS buckets.
    pub aws_bucket_prefix: String,
    /// Prefix of the Google Cloud buckets, unused by the AWS jobs.
    #[serde(default)]
    pub gs_bucket_prefix: Option<String>,
}

/// Read-only project → bucket table plus the suffix exception lists.
#[derive(Debug, Clone, Default)]
pub struct BucketMapping {
    projects: BTreeMap<String, ProjectBuckets>,
    postfix_1_exceptions: BTreeSet<String>,
    postfix_2_exceptions: BTreeSet<String>,
}

impl BucketMapping {
    /// Builds a mapping from its parts.
    #[must_use]
    pub fn new(
        projects: BTreeMap<String, ProjectBuckets>,
        postfix_1_exceptions: impl IntoIterator<Item = String>,
        postfix_2_exceptions: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            projects,
            postfix_1_exceptions: postfix_1_exceptions.into_iter().collect(),
            postfix_2_exceptions: postfix_2_exceptions.into_iter().collect(),
        }
    }

    /// Parses a project map JSON document
    /// (`{"<project_id>": {"aws_bucket_prefix": "..."}}`) and takes the
    /// exception lists from `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`serde_json::Error`] if the document has the wrong shape.
    pub fn from_json(json: &str, settings: &Settings) -> Result<Self, serde_json::Error> {
        let projects: BTreeMap<String, ProjectBuckets> = serde_json::from_str(json)?;
        Ok(Self::new(
            projects,
            settings.postfix_1_exceptions.iter().cloned(),
            settings.postfix_2_exceptions.iter().cloned(),
        ))
    }

    /// Loads the project map from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`BucketMapError`] if the file cannot be read or parsed.
    pub fn load(path: &Path, settings: &Settings) -> Result<Self, BucketMapError> {
        let json = std::fs::read_to_string(path).map_err(|source| BucketMapError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mapping = Self::from_json(&json, settings).map_err(|source| BucketMapError::Json {
            path: path.display().to_string(),
            source,
        })?;
        log::info!(
            "Loaded bucket mapping for {} projects from {}",
            mapping.len(),
            path.display()
        );
        Ok(mapping)
    }

    /// Number of mapped projects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.projects.len()
    }

    /// Whether no project is mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Resolves the destination bucket of a project for the given ACL.
    ///
    /// Pure: no I/O, and the same inputs always give the same name.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::UnknownProject`] if `project_id` is not in
    /// the map. There is no fallback bucket.
    pub fn resolve(&self, project_id: &str, acl: &Acl) -> Result<String, ResolveError> {
        let prefix = &self
            .projects
            .get(project_id)
            .ok_or_else(|| ResolveError::UnknownProject {
                project_id: project_id.to_string(),
                available: self.projects.len(),
            })?
            .aws_bucket_prefix;

        let is_target = prefix.contains(TARGET_MARKER);
        let in_postfix_1 = self.postfix_1_exceptions.contains(prefix);
        let in_postfix_2 = self.postfix_2_exceptions.contains(prefix);

        // Postfix-1 membership wins over postfix-2 on both sides; it only
        // changes the open name.
        let bucket = if acl.is_open() {
            if is_target {
                TARGET_OPEN_BUCKET.to_string()
            } else if in_postfix_1 {
                format!("{prefix}-open")
            } else {
                format!("{prefix}-2-open")
            }
        } else if is_target {
            TARGET_CONTROLLED_BUCKET.to_string()
        } else if in_postfix_2 && !in_postfix_1 {
            format!("{prefix}-2-controlled")
        } else {
            format!("{prefix}-controlled")
        };

        Ok(bucket)
    }

    /// Fills `record.destination_bucket` if it is not set yet and returns
    /// the bucket.
    ///
    /// # Errors
    ///
    /// See [`BucketMapping::resolve`].
    pub fn resolve_record<'a>(&self, record: &'a mut FileRecord) -> Result<&'a str, ResolveError> {
        if record.destination_bucket.is_none() {
            let bucket = self.resolve(&record.project_id, &record.acl)?;
            record.destination_bucket = Some(bucket);
        }
        Ok(record.destination_bucket.as_deref().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(prefix: &str) -> ProjectBuckets {
        ProjectBuckets {
            aws_bucket_prefix: prefix.to_string(),
            gs_bucket_prefix: Some(prefix.to_string()),
        }
    }

    fn mapping() -> BucketMapping {
        let mut projects = BTreeMap::new();
        projects.insert("ALICE".to_string(), project("test-gdc-xyz-phs000111"));
        projects.insert("BOB".to_string(), project("test-gdc-abc-phs000222"));
        projects.insert("CHARLIE".to_string(), project("test-gdc-def-phs000333"));
        projects.insert("TARGET-AML".to_string(), project("gdc-target-phs000218"));
        BucketMapping::new(
            projects,
            ["test-gdc-xyz-phs000111".to_string()],
            ["test-gdc-abc-phs000222".to_string()],
        )
    }

    fn controlled() -> Acl {
        Acl::Controlled(vec!["phs000111".to_string()])
    }

    #[test]
    fn postfix_1_exception_drops_the_2_on_open_only() {
        let m = mapping();
        assert_eq!(
            m.resolve("ALICE", &Acl::Open).unwrap(),
            "test-gdc-xyz-phs000111-open"
        );
        assert_eq!(
            m.resolve("ALICE", &controlled()).unwrap(),
            "test-gdc-xyz-phs000111-controlled"
        );
    }

    #[test]
    fn postfix_2_exception_keeps_the_2_on_both_sides() {
        let m = mapping();
        assert_eq!(
            m.resolve("BOB", &Acl::Open).unwrap(),
            "test-gdc-abc-phs000222-2-open"
        );
        assert_eq!(
            m.resolve("BOB", &controlled()).unwrap(),
            "test-gdc-abc-phs000222-2-controlled"
        );
    }

    #[test]
    fn default_suffixes() {
        let m = mapping();
        assert_eq!(
            m.resolve("CHARLIE", &Acl::Open).unwrap(),
            "test-gdc-def-phs000333-2-open"
        );
        assert_eq!(
            m.resolve("CHARLIE", &controlled()).unwrap(),
            "test-gdc-def-phs000333-controlled"
        );
    }

    #[test]
    fn target_program_uses_fixed_buckets() {
        let m = mapping();
        assert_eq!(
            m.resolve("TARGET-AML", &Acl::Open).unwrap(),
            TARGET_OPEN_BUCKET
        );
        assert_eq!(
            m.resolve("TARGET-AML", &controlled()).unwrap(),
            TARGET_CONTROLLED_BUCKET
        );
    }

    #[test]
    fn unknown_project_is_an_error() {
        let m = mapping();
        assert_eq!(
            m.resolve("DAVE", &Acl::Open),
            Err(ResolveError::UnknownProject {
                project_id: "DAVE".to_string(),
                available: 4,
            })
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let m = mapping();
        let first = m.resolve("CHARLIE", &controlled());
        let second = m.resolve("CHARLIE", &controlled());
        assert_eq!(first, second);
    }

    #[test]
    fn resolve_record_keeps_existing_bucket() {
        let m = mapping();
        let mut record = FileRecord {
            id: "guid".to_string(),
            file_name: "a.bam".to_string(),
            size: 1,
            md5: None,
            acl: Acl::Open,
            base_id: "base".to_string(),
            project_id: "DAVE".to_string(),
            source_url: String::new(),
            destination_bucket: Some("preset".to_string()),
        };
        assert_eq!(m.resolve_record(&mut record).unwrap(), "preset");

        record.destination_bucket = None;
        record.project_id = "ALICE".to_string();
        assert_eq!(
            m.resolve_record(&mut record).unwrap(),
            "test-gdc-xyz-phs000111-open"
        );
    }

    #[test]
    fn parses_project_map_json() {
        let settings = Settings {
            postfix_1_exceptions: vec!["test-gdc-xyz-phs000111".to_string()],
            ..Settings::default()
        };
        let json = r#"{
            "ALICE": {
                "aws_bucket_prefix": "test-gdc-xyz-phs000111",
                "gs_bucket_prefix": "test-gdc-xyz-phs000111"
            },
            "CHARLIE": {"aws_bucket_prefix": "test-gdc-def-phs000333"}
        }"#;
        let m = BucketMapping::from_json(json, &settings).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(
            m.resolve("ALICE", &Acl::Open).unwrap(),
            "test-gdc-xyz-phs000111-open"
        );
    }
}
