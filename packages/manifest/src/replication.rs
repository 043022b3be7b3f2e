//! Replication input and outcome manifests.
//!
//! The input manifest has one object per line with the columns
//! [`INPUT_COLUMNS`] (extra columns are ignored). Rows are validated into
//! [`FileRecord`]s here so that nothing downstream ever sees a malformed
//! size, checksum or ACL; invalid rows are returned as [`RejectedRow`]s.
//!
//! A dispatch run writes one output manifest per [`JobOutcome`], each with
//! the columns [`OUTPUT_COLUMNS`] in that order, plus a manifest of the
//! rows rejected at parse time with the columns [`REJECTED_COLUMNS`].

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use replicator_models::{Acl, AclError, FileRecord, JobOutcome};
use serde::{Deserialize, Serialize};

use crate::{MEMORY_PATH, ManifestError};

/// Columns every replication input manifest must have.
pub const INPUT_COLUMNS: [&str; 8] = [
    "id",
    "file_name",
    "size",
    "acl",
    "md5",
    "baseid",
    "url",
    "project_id",
];

/// Columns of the replication output manifests, in file order.
pub const OUTPUT_COLUMNS: [&str; 7] = [
    "guid",
    "md5",
    "size",
    "authz",
    "acl",
    "file_name",
    "urls",
];

/// Columns of the rejected rows manifest, in file order.
pub const REJECTED_COLUMNS: [&str; 3] = ["line", "id", "error"];

/// Why a manifest row was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowError {
    /// A required field is empty.
    #[error("empty '{column}'")]
    Empty {
        /// Column name.
        column: &'static str,
    },

    /// The size is not an unsigned integer.
    #[error("invalid size '{value}'")]
    InvalidSize {
        /// Raw value.
        value: String,
    },

    /// The checksum is not a 32 character hex MD5.
    #[error("invalid md5 '{value}'")]
    InvalidMd5 {
        /// Raw value.
        value: String,
    },

    /// The ACL has an unsupported shape.
    #[error("invalid acl: {0}")]
    Acl(#[from] AclError),

    /// The row could not be decoded at all.
    #[error("malformed row: {message}")]
    Malformed {
        /// Decoder message.
        message: String,
    },
}

/// A row that failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRow {
    /// 1-based line number in the manifest.
    pub line: u64,
    /// Object id, when the row had one.
    pub id: Option<String>,
    /// Validation failure.
    pub error: RowError,
}

impl std::fmt::Display for RejectedRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {} ({}): {}",
            self.line,
            self.id.as_deref().unwrap_or("no id"),
            self.error
        )
    }
}

/// Result of reading an input manifest.
#[derive(Debug, Default)]
pub struct ParsedManifest {
    /// Valid records, in manifest order.
    pub records: Vec<FileRecord>,
    /// Rows rejected at parse time.
    pub rejected: Vec<RejectedRow>,
}

/// Raw input row, before validation.
#[derive(Debug, Deserialize)]
struct InputRow {
    id: String,
    file_name: String,
    size: String,
    acl: String,
    md5: String,
    baseid: String,
    url: String,
    project_id: String,
}

/// One output manifest row.
#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    guid: &'a str,
    md5: &'a str,
    size: u64,
    authz: String,
    acl: String,
    file_name: &'a str,
    urls: String,
}

impl<'a> From<&'a FileRecord> for OutputRow<'a> {
    fn from(record: &'a FileRecord) -> Self {
        Self {
            guid: &record.id,
            md5: record.md5.as_deref().unwrap_or_default(),
            size: record.size,
            authz: record.acl.authz(),
            acl: record.acl.to_string(),
            file_name: &record.file_name,
            urls: record.destination_url().unwrap_or_default(),
        }
    }
}

/// One rejected rows manifest row.
#[derive(Debug, Serialize)]
struct RejectedOutputRow<'a> {
    line: u64,
    id: &'a str,
    error: String,
}

impl<'a> From<&'a RejectedRow> for RejectedOutputRow<'a> {
    fn from(row: &'a RejectedRow) -> Self {
        Self {
            line: row.line,
            id: row.id.as_deref().unwrap_or_default(),
            error: row.error.to_string(),
        }
    }
}

/// Summary of one written output manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeManifest {
    /// Outcome whose records the file holds.
    pub outcome: JobOutcome,
    /// Where the file was written.
    pub path: PathBuf,
    /// Number of data rows (excluding the header).
    pub rows: usize,
}

/// Summary of a written rejected rows manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedManifest {
    /// Where the file was written.
    pub path: PathBuf,
    /// Number of data rows (excluding the header).
    pub rows: usize,
}

/// Reads and validates a replication input manifest from a file.
///
/// # Errors
///
/// Returns [`ManifestError`] if the file cannot be opened, is not valid
/// TSV, or lacks a required column. Invalid rows do not fail the read;
/// they are returned in [`ParsedManifest::rejected`].
pub fn read_records_from_path(path: &Path) -> Result<ParsedManifest, ManifestError> {
    let file = std::fs::File::open(path).map_err(|source| ManifestError::Io {
        path: path.display().to_string(),
        source,
    })?;
    read_records(file, &path.display().to_string())
}

/// Reads and validates a replication input manifest.
///
/// `label` names the source in errors.
///
/// # Errors
///
/// See [`read_records_from_path`].
pub fn read_records(reader: impl Read, label: &str) -> Result<ParsedManifest, ManifestError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .trim(csv::Trim::Headers)
        .from_reader(reader);

    let headers = reader
        .headers()
        .map_err(|source| ManifestError::Csv {
            path: label.to_string(),
            source,
        })?
        .clone();

    for column in INPUT_COLUMNS {
        if !headers.iter().any(|h| h == column) {
            return Err(ManifestError::MissingColumn {
                path: label.to_string(),
                column: column.to_string(),
            });
        }
    }

    let id_column = headers.iter().position(|h| h == "id");

    let mut parsed = ParsedManifest::default();
    for result in reader.records() {
        let record = result.map_err(|source| ManifestError::Csv {
            path: label.to_string(),
            source,
        })?;
        let line = record.position().map_or(0, csv::Position::line);

        let row = match record.deserialize::<InputRow>(Some(&headers)) {
            Ok(row) => row,
            Err(e) => {
                parsed.rejected.push(RejectedRow {
                    line,
                    id: id_column
                        .and_then(|i| record.get(i))
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string),
                    error: RowError::Malformed {
                        message: e.to_string(),
                    },
                });
                continue;
            }
        };

        let id = row.id.clone();
        match parse_row(row) {
            Ok(file) => parsed.records.push(file),
            Err(error) => parsed.rejected.push(RejectedRow {
                line,
                id: Some(id).filter(|id| !id.is_empty()),
                error,
            }),
        }
    }

    log::info!(
        "Parsed {} records from {label} ({} rejected)",
        parsed.records.len(),
        parsed.rejected.len()
    );
    for rejected in &parsed.rejected {
        log::error!("Rejected manifest row {rejected}");
    }

    Ok(parsed)
}

/// Validates one raw row.
fn parse_row(row: InputRow) -> Result<FileRecord, RowError> {
    let id = required(row.id, "id")?;
    let file_name = required(row.file_name, "file_name")?;
    let project_id = required(row.project_id, "project_id")?;

    let size = row
        .size
        .trim()
        .parse::<u64>()
        .map_err(|_| RowError::InvalidSize { value: row.size })?;

    let md5 = parse_md5(&row.md5)?;
    let acl = Acl::parse(&row.acl)?;

    Ok(FileRecord {
        id,
        file_name,
        size,
        md5,
        acl,
        base_id: row.baseid.trim().to_string(),
        project_id,
        source_url: row.url.trim().to_string(),
        destination_bucket: None,
    })
}

fn required(value: String, column: &'static str) -> Result<String, RowError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(RowError::Empty { column });
    }
    Ok(trimmed.to_string())
}

/// Empty and `None` mean "no checksum".
fn parse_md5(raw: &str) -> Result<Option<String>, RowError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "None" {
        return Ok(None);
    }
    if trimmed.len() != 32 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(RowError::InvalidMd5 {
            value: trimmed.to_string(),
        });
    }
    Ok(Some(trimmed.to_ascii_lowercase()))
}

/// Writes one output manifest (header plus one row per record).
///
/// Returns the number of data rows written.
///
/// # Errors
///
/// Returns [`csv::Error`] if writing fails.
pub fn write_outcome_manifest<'a>(
    writer: impl Write,
    records: impl IntoIterator<Item = &'a FileRecord>,
) -> Result<usize, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(writer);

    writer.write_record(OUTPUT_COLUMNS)?;

    let mut rows = 0;
    for record in records {
        writer.serialize(OutputRow::from(record))?;
        rows += 1;
    }
    writer.flush()?;

    Ok(rows)
}

/// Path of the output manifest for `outcome`
/// (`<dir>/<stem>_<outcome>.tsv`, outcome in lowercase).
#[must_use]
pub fn outcome_manifest_path(dir: &Path, stem: &str, outcome: JobOutcome) -> PathBuf {
    dir.join(format!(
        "{stem}_{}.tsv",
        outcome.as_ref().to_ascii_lowercase()
    ))
}

/// Writes the three output manifests of a dispatch run.
///
/// Every outcome gets a file, even when it has no rows, so the row counts
/// of the three files always add up to the number of dispatched records.
///
/// # Errors
///
/// Returns [`ManifestError`] if a file cannot be created or written.
pub fn write_outcome_manifests(
    dir: &Path,
    stem: &str,
    results: &[(FileRecord, JobOutcome)],
) -> Result<Vec<OutcomeManifest>, ManifestError> {
    std::fs::create_dir_all(dir).map_err(|source| ManifestError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let mut written = Vec::with_capacity(JobOutcome::ALL.len());
    for outcome in JobOutcome::ALL {
        let path = outcome_manifest_path(dir, stem, outcome);
        let file = std::fs::File::create(&path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let records = results
            .iter()
            .filter(|(_, o)| *o == outcome)
            .map(|(record, _)| record);
        let rows =
            write_outcome_manifest(file, records).map_err(|source| ManifestError::Csv {
                path: path.display().to_string(),
                source,
            })?;

        log::info!("Wrote {rows} {outcome} records to {}", path.display());
        written.push(OutcomeManifest {
            outcome,
            path,
            rows,
        });
    }

    Ok(written)
}

/// Path of the rejected rows manifest (`<dir>/<stem>_rejected.tsv`).
#[must_use]
pub fn rejected_manifest_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}_rejected.tsv"))
}

/// Writes the rejected rows manifest (header plus one row per rejection).
///
/// Returns the number of data rows written.
///
/// # Errors
///
/// Returns [`csv::Error`] if writing fails.
pub fn write_rejected_manifest<'a>(
    writer: impl Write,
    rejected: impl IntoIterator<Item = &'a RejectedRow>,
) -> Result<usize, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(writer);

    writer.write_record(REJECTED_COLUMNS)?;

    let mut rows = 0;
    for row in rejected {
        writer.serialize(RejectedOutputRow::from(row))?;
        rows += 1;
    }
    writer.flush()?;

    Ok(rows)
}

/// Writes the rejected rows of a manifest next to its outcome manifests.
///
/// The file is written even when nothing was rejected.
///
/// # Errors
///
/// Returns [`ManifestError`] if the file cannot be created or written.
pub fn write_rejected_manifest_file(
    dir: &Path,
    stem: &str,
    rejected: &[RejectedRow],
) -> Result<RejectedManifest, ManifestError> {
    std::fs::create_dir_all(dir).map_err(|source| ManifestError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let path = rejected_manifest_path(dir, stem);
    let file = std::fs::File::create(&path).map_err(|source| ManifestError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let rows = write_rejected_manifest(file, rejected).map_err(|source| ManifestError::Csv {
        path: path.display().to_string(),
        source,
    })?;

    log::info!("Wrote {rows} rejected rows to {}", path.display());
    Ok(RejectedManifest { path, rows })
}

/// Reads an in-memory manifest (e.g. downloaded from object storage).
///
/// # Errors
///
/// See [`read_records_from_path`].
pub fn read_records_from_bytes(bytes: &[u8]) -> Result<ParsedManifest, ManifestError> {
    read_records(bytes, MEMORY_PATH)
}
