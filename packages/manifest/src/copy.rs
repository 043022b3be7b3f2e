//! Bucket copy manifests.
//!
//! A copy manifest names objects already in a source bucket, one per line,
//! with at least the columns [`COPY_COLUMNS`]. `url` is either the object
//! key or an `s3://bucket/key` URL; `id` is read when present for logs.

use std::io::Read;

use serde::Deserialize;

use crate::{MEMORY_PATH, ManifestError};

/// Columns every copy manifest must have.
pub const COPY_COLUMNS: [&str; 2] = ["project_id", "url"];

/// One object to copy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CopyRow {
    /// Object id, when the manifest has an `id` column.
    #[serde(default)]
    pub id: Option<String>,
    /// Project selecting the destination bucket.
    pub project_id: String,
    /// Object key or `s3://` URL in the source bucket.
    pub url: String,
}

impl CopyRow {
    /// Identifier for logs: the id if present, else the url.
    #[must_use]
    pub fn label(&self) -> &str {
        self.id
            .as_deref()
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.url)
    }
}

/// Reads a copy manifest.
///
/// `label` names the source in errors.
///
/// # Errors
///
/// Returns [`ManifestError`] if the data is not valid TSV or lacks a
/// required column.
pub fn read_copy_rows(reader: impl Read, label: &str) -> Result<Vec<CopyRow>, ManifestError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader
        .headers()
        .map_err(|source| ManifestError::Csv {
            path: label.to_string(),
            source,
        })?
        .clone();
    for column in COPY_COLUMNS {
        if !headers.iter().any(|h| h == column) {
            return Err(ManifestError::MissingColumn {
                path: label.to_string(),
                column: column.to_string(),
            });
        }
    }

    let rows = reader
        .deserialize::<CopyRow>()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ManifestError::Csv {
            path: label.to_string(),
            source,
        })?;

    log::info!("Parsed {} copy rows from {label}", rows.len());
    Ok(rows)
}

/// Reads an in-memory copy manifest.
///
/// # Errors
///
/// See [`read_copy_rows`].
pub fn read_copy_rows_from_bytes(bytes: &[u8]) -> Result<Vec<CopyRow>, ManifestError> {
    read_copy_rows(bytes, MEMORY_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_rows_with_and_without_ids() {
        let manifest = "id\tproject_id\turl\textra\n\
            guid-1\tALICE\ts3://src/guid-1/a.bam\tx\n\
            \tBOB\tguid-2/b.bam\ty\n";

        let rows = read_copy_rows_from_bytes(manifest.as_bytes()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id.as_deref(), Some("guid-1"));
        assert_eq!(rows[0].url, "s3://src/guid-1/a.bam");
        assert_eq!(rows[0].label(), "guid-1");
        assert_eq!(rows[1].project_id, "BOB");
        assert_eq!(rows[1].label(), "guid-2/b.bam");
    }

    #[test]
    fn id_column_is_optional() {
        let manifest = "project_id\turl\nALICE\tk\n";
        let rows = read_copy_rows_from_bytes(manifest.as_bytes()).unwrap();
        assert_eq!(rows[0].id, None);
    }

    #[test]
    fn url_column_is_required() {
        let manifest = "id\tproject_id\nguid\tALICE\n";
        let err = read_copy_rows_from_bytes(manifest.as_bytes()).unwrap_err();
        assert!(matches!(
            err,
            ManifestError::MissingColumn { ref column, .. } if column == "url"
        ));
    }
}
