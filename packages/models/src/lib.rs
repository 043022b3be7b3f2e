#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Shared types for the bucket replication and bucket manifest jobs.
//!
//! A replication run reads a manifest of [`FileRecord`]s, decides per
//! record whether the destination object already exists, and submits one
//! transfer job per remaining record. Each transfer splits the object into
//! [`ChunkRange`]s and collects one [`PartCompletion`] per uploaded part.
//! The run ends with one [`JobOutcome`] per record, summarized in a
//! [`DispatchSummary`].

pub mod progress;

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// ACL tag granting public access.
pub const OPEN_TAG: &str = "open";

/// Program-scoped ACL tags are dbGaP study accessions (`phs000178`, ...).
static PROGRAM_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^phs[0-9]+").expect("valid regex"));

/// Errors raised while validating an ACL column.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AclError {
    /// The ACL list contained no tags.
    #[error("ACL is empty")]
    Empty,

    /// `open` was combined with other tags.
    #[error("ACL mixes 'open' with program tags: {raw}")]
    MixedOpen {
        /// The offending tag list.
        raw: String,
    },

    /// A tag did not match the program accession pattern.
    #[error("Unrecognized ACL tag: {tag}")]
    UnrecognizedTag {
        /// The offending tag.
        tag: String,
    },
}

/// Access scope of a data object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Acl {
    /// Exactly `["open"]`.
    Open,
    /// One or more program tags (never empty).
    Controlled(Vec<String>),
}

impl Acl {
    /// Parses the manifest representation of an ACL.
    ///
    /// Accepts the bracketed list form written by the upstream exporter
    /// (`['open']`, `['phs000178', 'phs000179']`) as well as a bare
    /// comma-separated list (`phs000178,phs000179`).
    ///
    /// # Errors
    ///
    /// Returns [`AclError`] if the list is empty, mixes `open` with program
    /// tags, or contains a tag that is not a program accession.
    pub fn parse(raw: &str) -> Result<Self, AclError> {
        let trimmed = raw.trim();
        let inner = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(trimmed);

        let tags = inner
            .split(',')
            .map(|t| t.trim().trim_matches(|c| c == '\'' || c == '"').trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        Self::from_tags(tags)
    }

    /// Builds an ACL from already-split tags.
    ///
    /// # Errors
    ///
    /// See [`Acl::parse`].
    pub fn from_tags(tags: Vec<String>) -> Result<Self, AclError> {
        if tags.is_empty() {
            return Err(AclError::Empty);
        }

        if tags.iter().any(|t| t == OPEN_TAG) {
            if tags.len() == 1 {
                return Ok(Self::Open);
            }
            return Err(AclError::MixedOpen {
                raw: tags.join(","),
            });
        }

        if let Some(bad) = tags.iter().find(|t| !PROGRAM_TAG_RE.is_match(t)) {
            return Err(AclError::UnrecognizedTag { tag: bad.clone() });
        }

        Ok(Self::Controlled(tags))
    }

    /// Whether this ACL grants public access.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// The individual tags, in manifest order.
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        match self {
            Self::Open => vec![OPEN_TAG],
            Self::Controlled(tags) => tags.iter().map(String::as_str).collect(),
        }
    }

    /// Authorization resource paths for the output manifest.
    ///
    /// `/open` for public objects, one `/programs/<tag>` per program tag
    /// otherwise, space separated.
    #[must_use]
    pub fn authz(&self) -> String {
        match self {
            Self::Open => "/open".to_string(),
            Self::Controlled(tags) => tags
                .iter()
                .map(|t| format!("/programs/{t}"))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

impl std::fmt::Display for Acl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let quoted: Vec<String> = self.tags().iter().map(|t| format!("'{t}'")).collect();
        write!(f, "[{}]", quoted.join(", "))
    }
}

/// One row of a replication manifest, validated at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Object identifier (GUID) in the source repository.
    pub id: String,
    /// File name; the destination key is `<id>/<file_name>`.
    pub file_name: String,
    /// Object size in bytes.
    pub size: u64,
    /// Lowercase hex MD5, if the manifest carries one.
    pub md5: Option<String>,
    /// Access scope.
    pub acl: Acl,
    /// Base identifier shared by versions of the same file.
    pub base_id: String,
    /// Project the file belongs to; selects the destination bucket.
    pub project_id: String,
    /// Download URL in the source repository.
    pub source_url: String,
    /// Derived destination bucket. Never read from input.
    pub destination_bucket: Option<String>,
}

impl FileRecord {
    /// Destination object key (`<id>/<file_name>`).
    #[must_use]
    pub fn object_key(&self) -> String {
        format!("{}/{}", self.id, self.file_name)
    }

    /// Destination URL once the bucket has been resolved.
    #[must_use]
    pub fn destination_url(&self) -> Option<String> {
        self.destination_bucket
            .as_ref()
            .map(|bucket| format!("s3://{bucket}/{}", self.object_key()))
    }
}

/// Outcome of dispatching one [`FileRecord`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutcome {
    /// A transfer job was accepted by the job queue.
    Submitted,
    /// The destination object already exists and matches.
    Skipped,
    /// The record could not be submitted.
    Failed,
}

impl JobOutcome {
    /// All outcomes, in output-manifest order.
    pub const ALL: [Self; 3] = [Self::Submitted, Self::Skipped, Self::Failed];
}

/// Aggregated outcome counts of a dispatch run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    /// Records whose job was accepted.
    pub submitted: u64,
    /// Records already present at the destination.
    pub skipped: u64,
    /// Records that could not be submitted.
    pub failed: u64,
}

impl DispatchSummary {
    /// Counts one outcome.
    pub const fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Submitted => self.submitted += 1,
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Failed => self.failed += 1,
        }
    }

    /// Total number of records considered.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.submitted + self.skipped + self.failed
    }
}

impl std::fmt::Display for DispatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} submitted, {} skipped (already exist), {} failed",
            self.submitted, self.skipped, self.failed
        )
    }
}

/// One planned part of a multipart upload.
///
/// Ranges are stored as offset + length so that the single empty part of
/// a zero-byte object is representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// 1-based part number.
    pub part_number: u32,
    /// First byte offset.
    pub start: u64,
    /// Number of bytes in this part.
    pub length: u64,
}

impl ChunkRange {
    /// Inclusive last byte offset, or `None` for an empty part.
    #[must_use]
    pub const fn end(&self) -> Option<u64> {
        if self.length == 0 {
            None
        } else {
            Some(self.start + self.length - 1)
        }
    }

    /// HTTP `Range` header value (`bytes=<start>-<end>`), or `None` for an
    /// empty part.
    #[must_use]
    pub fn range_header(&self) -> Option<String> {
        self.end().map(|end| format!("bytes={}-{end}", self.start))
    }
}

/// Completion record of one uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartCompletion {
    /// 1-based part number.
    pub part_number: u32,
    /// Provider-assigned completion token (`ETag`).
    pub e_tag: String,
    /// Bytes uploaded in this part.
    pub byte_count: u64,
}

/// One row of a bucket manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// `s3://bucket/key` of the object.
    pub url: String,
    /// Size in bytes (`0` when the worker reported an error).
    pub size: u64,
    /// MD5 hex digest, or the worker's error text.
    pub md5: String,
}

/// Message published by an object metadata worker.
///
/// Successful workers send `{url, md5, size}`. Failed workers send
/// `{url, ERROR}`; an access denial is sent as `{ERROR}` alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataMessage {
    /// `s3://bucket/key` of the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// MD5 hex digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    /// Size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Error text reported by the worker.
    #[serde(
        rename = "ERROR",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
}

impl MetadataMessage {
    /// A successful metadata computation.
    #[must_use]
    pub const fn success(url: String, md5: String, size: u64) -> Self {
        Self {
            url: Some(url),
            md5: Some(md5),
            size: Some(size),
            error: None,
        }
    }

    /// A failed metadata computation.
    #[must_use]
    pub const fn failure(url: Option<String>, error: String) -> Self {
        Self {
            url,
            md5: None,
            size: None,
            error: Some(error),
        }
    }

    /// Converts the message into a manifest row.
    ///
    /// Errors become rows with `size = 0` and the error text in the `md5`
    /// column so that failures stay visible in the manifest.
    #[must_use]
    pub fn into_metadata(self) -> ObjectMetadata {
        let url = self.url.unwrap_or_default();
        if let Some(error) = self.error {
            return ObjectMetadata {
                url,
                size: 0,
                md5: error,
            };
        }
        ObjectMetadata {
            url,
            size: self.size.unwrap_or(0),
            md5: self.md5.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bracketed_open_acl() {
        assert_eq!(Acl::parse("['open']").unwrap(), Acl::Open);
        assert_eq!(Acl::parse("open").unwrap(), Acl::Open);
    }

    #[test]
    fn parses_program_acl_list() {
        let acl = Acl::parse("['phs000178', 'phs000179']").unwrap();
        assert_eq!(
            acl,
            Acl::Controlled(vec!["phs000178".to_string(), "phs000179".to_string()])
        );
        assert!(!acl.is_open());
    }

    #[test]
    fn rejects_malformed_acls() {
        assert_eq!(Acl::parse("[]").unwrap_err(), AclError::Empty);
        assert!(matches!(
            Acl::parse("['open', 'phs000178']"),
            Err(AclError::MixedOpen { .. })
        ));
        assert!(matches!(
            Acl::parse("['TCGA']"),
            Err(AclError::UnrecognizedTag { .. })
        ));
    }

    #[test]
    fn acl_display_matches_manifest_form() {
        assert_eq!(Acl::Open.to_string(), "['open']");
        let acl = Acl::parse("phs000178,phs000179").unwrap();
        assert_eq!(acl.to_string(), "['phs000178', 'phs000179']");
    }

    #[test]
    fn acl_authz_paths() {
        assert_eq!(Acl::Open.authz(), "/open");
        let acl = Acl::parse("['phs000178', 'phs000179']").unwrap();
        assert_eq!(acl.authz(), "/programs/phs000178 /programs/phs000179");
    }

    #[test]
    fn outcome_uses_screaming_case() {
        assert_eq!(JobOutcome::Submitted.to_string(), "SUBMITTED");
        assert_eq!("SKIPPED".parse::<JobOutcome>().unwrap(), JobOutcome::Skipped);
    }

    #[test]
    fn summary_counts_outcomes() {
        let mut summary = DispatchSummary::default();
        summary.record(JobOutcome::Submitted);
        summary.record(JobOutcome::Skipped);
        summary.record(JobOutcome::Skipped);
        summary.record(JobOutcome::Failed);
        assert_eq!(summary.total(), 4);
        assert_eq!(summary.skipped, 2);
    }

    #[test]
    fn chunk_range_header() {
        let range = ChunkRange {
            part_number: 2,
            start: 100,
            length: 50,
        };
        assert_eq!(range.end(), Some(149));
        assert_eq!(range.range_header().as_deref(), Some("bytes=100-149"));

        let empty = ChunkRange {
            part_number: 1,
            start: 0,
            length: 0,
        };
        assert_eq!(empty.range_header(), None);
    }

    #[test]
    fn error_message_becomes_manifest_row() {
        let msg: MetadataMessage =
            serde_json::from_str(r#"{"url": "s3://b/k", "ERROR": "boom"}"#).unwrap();
        assert_eq!(
            msg.into_metadata(),
            ObjectMetadata {
                url: "s3://b/k".to_string(),
                size: 0,
                md5: "boom".to_string(),
            }
        );
    }

    #[test]
    fn success_message_round_trips_fields() {
        let msg = MetadataMessage::success("s3://b/k".to_string(), "abc".to_string(), 7);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("ERROR"));
        let row = serde_json::from_str::<MetadataMessage>(&json)
            .unwrap()
            .into_metadata();
        assert_eq!(row.size, 7);
        assert_eq!(row.md5, "abc");
    }
}
