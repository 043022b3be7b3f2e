//! Bucket manifest (`url`, `size`, `md5` per object).

use std::io::Write;

use chrono::{DateTime, TimeZone};
use replicator_models::ObjectMetadata;

use crate::{MEMORY_PATH, ManifestError};

/// Columns of a bucket manifest, in file order.
pub const BUCKET_MANIFEST_COLUMNS: [&str; 3] = ["url", "size", "md5"];

/// File name of the manifest of `bucket` generated at `at`
/// (`manifest_<bucket>_<mm>_<dd>_<yy>_<HH>:<MM>:<SS>.tsv`).
#[must_use]
pub fn bucket_manifest_file_name<Tz>(bucket: &str, at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("manifest_{bucket}_{}.tsv", at.format("%m_%d_%y_%H:%M:%S"))
}

/// Writes a bucket manifest, header first.
///
/// # Errors
///
/// Returns [`csv::Error`] if writing fails.
pub fn write_bucket_manifest<'a>(
    writer: impl Write,
    rows: impl IntoIterator<Item = &'a ObjectMetadata>,
) -> Result<usize, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(writer);

    writer.write_record(BUCKET_MANIFEST_COLUMNS)?;

    let mut count = 0;
    for row in rows {
        writer.serialize(row)?;
        count += 1;
    }
    writer.flush()?;

    Ok(count)
}

/// Encodes a bucket manifest into memory, ready for upload.
///
/// # Errors
///
/// Returns [`ManifestError::Csv`] if encoding fails.
pub fn encode_bucket_manifest(rows: &[ObjectMetadata]) -> Result<Vec<u8>, ManifestError> {
    let mut buf = Vec::new();
    write_bucket_manifest(&mut buf, rows).map_err(|source| ManifestError::Csv {
        path: MEMORY_PATH.to_string(),
        source,
    })?;
    Ok(buf)
}
