//! Input and output manifests of a replication run.

use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures::TryStreamExt as _;
use replicator_manifest::replication::{
    OutcomeManifest, ParsedManifest, RejectedManifest, RejectedRow, read_records_from_bytes,
    read_records_from_path, write_outcome_manifests, write_rejected_manifest_file,
};
use replicator_storage::{ObjectStore, S3Location, StorageError};

use crate::{DispatchError, DispatchReport};

/// Where an input manifest lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSource {
    /// Local file.
    Local(PathBuf),
    /// Object in S3.
    S3(S3Location),
}

impl ManifestSource {
    /// Parses a local path or an `s3://bucket/key` URL.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidUrl`] for an `s3://` URL without a
    /// bucket or key.
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        if !raw.starts_with("s3://") {
            return Ok(Self::Local(PathBuf::from(raw)));
        }
        let location = S3Location::parse(raw)?;
        if location.key.is_empty() {
            return Err(StorageError::InvalidUrl {
                url: raw.to_string(),
            });
        }
        Ok(Self::S3(location))
    }

    /// File stem used to name the output manifests.
    #[must_use]
    pub fn stem(&self) -> String {
        let name = match self {
            Self::Local(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Self::S3(location) => location
                .key
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string(),
        };
        let stem = name
            .rsplit_once('.')
            .map_or(name.as_str(), |(stem, _)| stem)
            .to_string();
        if stem.is_empty() {
            "manifest".to_string()
        } else {
            stem
        }
    }
}

impl std::fmt::Display for ManifestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::S3(location) => write!(f, "{location}"),
        }
    }
}

/// Reads an object into memory.
///
/// # Errors
///
/// Returns [`StorageError`] if the object cannot be read.
pub async fn read_object(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
) -> Result<Bytes, StorageError> {
    let body = store.get(bucket, key).await?;
    let capacity = body
        .content_length
        .and_then(|len| usize::try_from(len).ok())
        .unwrap_or_default();
    let buffer = body
        .chunks
        .try_fold(BytesMut::with_capacity(capacity), |mut buffer, chunk| async move {
            buffer.extend_from_slice(&chunk);
            Ok(buffer)
        })
        .await?;
    Ok(buffer.freeze())
}

/// Reads a local file or an S3 object fully.
///
/// # Errors
///
/// Returns [`DispatchError`] if the file or object cannot be read.
pub async fn read_source(
    store: &dyn ObjectStore,
    source: &ManifestSource,
) -> Result<Bytes, DispatchError> {
    match source {
        ManifestSource::Local(path) => std::fs::read(path)
            .map(Bytes::from)
            .map_err(|source| DispatchError::Io {
                path: path.display().to_string(),
                source,
            }),
        ManifestSource::S3(location) => {
            Ok(read_object(store, &location.bucket, &location.key).await?)
        }
    }
}

/// Loads and validates an input manifest.
///
/// Rejected rows are kept apart in [`ParsedManifest::rejected`].
///
/// # Errors
///
/// Returns [`DispatchError`] if the manifest cannot be read or lacks a
/// required column.
pub async fn load_manifest(
    store: &dyn ObjectStore,
    source: &ManifestSource,
) -> Result<ParsedManifest, DispatchError> {
    let parsed = match source {
        ManifestSource::Local(path) => read_records_from_path(path)?,
        ManifestSource::S3(location) => {
            let bytes = read_object(store, &location.bucket, &location.key).await?;
            read_records_from_bytes(&bytes)?
        }
    };

    log::info!(
        "Loaded {} records from {source} ({} rejected)",
        parsed.records.len(),
        parsed.rejected.len()
    );

    Ok(parsed)
}

/// Manifests written at the end of a replication run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedManifests {
    /// One manifest per outcome.
    pub outcomes: Vec<OutcomeManifest>,
    /// Rows rejected before dispatch.
    pub rejected: RejectedManifest,
}

/// Writes the three outcome manifests and the rejected rows manifest to
/// `dir` and, when `out_bucket` is given, uploads each of them under its
/// file name.
///
/// # Errors
///
/// Returns [`DispatchError`] if a file cannot be written, read back or
/// uploaded.
pub async fn publish_outcomes(
    store: &dyn ObjectStore,
    report: &DispatchReport,
    rejected: &[RejectedRow],
    dir: &Path,
    stem: &str,
    out_bucket: Option<&str>,
) -> Result<PublishedManifests, DispatchError> {
    let published = PublishedManifests {
        outcomes: write_outcome_manifests(dir, stem, &report.outcomes)?,
        rejected: write_rejected_manifest_file(dir, stem, rejected)?,
    };

    if let Some(bucket) = out_bucket {
        let paths = published
            .outcomes
            .iter()
            .map(|m| m.path.as_path())
            .chain(std::iter::once(published.rejected.path.as_path()));
        for path in paths {
            upload_file(store, bucket, path).await?;
        }
    }

    Ok(published)
}

/// Uploads a local file to `bucket` under its file name.
async fn upload_file(
    store: &dyn ObjectStore,
    bucket: &str,
    path: &Path,
) -> Result<(), DispatchError> {
    let body = std::fs::read(path).map_err(|source| DispatchError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let key = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    store.put(bucket, &key, Bytes::from(body)).await?;
    log::info!("Uploaded {} to s3://{bucket}/{key}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use replicator_models::{Acl, DispatchSummary, FileRecord, JobOutcome};
    use replicator_storage::memory::MemoryStore;

    use super::*;

    const MANIFEST: &str = "id\tfile_name\tsize\tacl\tmd5\tbaseid\turl\tproject_id\n\
        guid-1\ta.bam\t1024\t['open']\tNone\tb1\thttps://api/data/guid-1\tALICE\n\
        guid-2\tb.bam\tnot-a-size\t['open']\tNone\tb2\thttps://api/data/guid-2\tALICE\n";

    #[test]
    fn parses_local_and_s3_sources() {
        assert_eq!(
            ManifestSource::parse("/data/run.tsv").unwrap(),
            ManifestSource::Local(PathBuf::from("/data/run.tsv"))
        );
        assert_eq!(
            ManifestSource::parse("s3://bucket/dir/run.tsv").unwrap(),
            ManifestSource::S3(S3Location {
                bucket: "bucket".to_string(),
                key: "dir/run.tsv".to_string(),
            })
        );
        assert!(ManifestSource::parse("s3://bucket").is_err());
    }

    #[test]
    fn stem_drops_directories_and_extension() {
        assert_eq!(ManifestSource::parse("/data/run.tsv").unwrap().stem(), "run");
        assert_eq!(
            ManifestSource::parse("s3://bucket/dir/run.v2.tsv").unwrap().stem(),
            "run.v2"
        );
    }

    #[tokio::test]
    async fn loads_manifest_from_s3() {
        let store = MemoryStore::new();
        store.insert("in", "run.tsv", Bytes::from_static(MANIFEST.as_bytes()));

        let source = ManifestSource::parse("s3://in/run.tsv").unwrap();
        let parsed = load_manifest(&store, &source).await.unwrap();

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].id, "guid-1");
        assert_eq!(parsed.rejected.len(), 1);
    }

    #[tokio::test]
    async fn missing_s3_manifest_is_an_error() {
        let store = MemoryStore::new();
        let source = ManifestSource::parse("s3://in/missing.tsv").unwrap();
        assert!(load_manifest(&store, &source).await.is_err());
    }

    #[tokio::test]
    async fn publishes_outcome_and_rejected_manifests() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();

        let record = FileRecord {
            id: "guid-1".to_string(),
            file_name: "a.bam".to_string(),
            size: 1,
            md5: None,
            acl: Acl::Open,
            base_id: "b1".to_string(),
            project_id: "ALICE".to_string(),
            source_url: String::new(),
            destination_bucket: Some("bucket-2-open".to_string()),
        };
        let mut summary = DispatchSummary::default();
        summary.record(JobOutcome::Skipped);
        let report = DispatchReport {
            summary,
            outcomes: vec![(record, JobOutcome::Skipped)],
        };

        let parsed = read_records_from_bytes(MANIFEST.as_bytes()).unwrap();

        let published = publish_outcomes(
            &store,
            &report,
            &parsed.rejected,
            dir.path(),
            "run",
            Some("out"),
        )
        .await
        .unwrap();

        assert_eq!(published.outcomes.len(), 3);
        assert_eq!(published.outcomes.iter().map(|m| m.rows).sum::<usize>(), 1);
        assert_eq!(published.rejected.rows, 1);
        assert_eq!(published.rejected.path, dir.path().join("run_rejected.tsv"));
        assert!(store.object("out", "run_skipped.tsv").is_some());
        assert!(store.object("out", "run_submitted.tsv").is_some());
        assert!(store.object("out", "run_failed.tsv").is_some());

        let rejected = store.object("out", "run_rejected.tsv").unwrap();
        let text = String::from_utf8(rejected.to_vec()).unwrap();
        assert_eq!(
            text,
            "line\tid\terror\n3\tguid-2\tinvalid size 'not-a-size'\n"
        );
    }

    #[tokio::test]
    async fn nothing_rejected_still_writes_an_empty_rejected_manifest() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();

        let published = publish_outcomes(
            &store,
            &DispatchReport::default(),
            &[],
            dir.path(),
            "run",
            None,
        )
        .await
        .unwrap();

        assert_eq!(published.rejected.rows, 0);
        assert!(published.rejected.path.exists());
        assert!(store.object("out", "run_rejected.tsv").is_none());
    }
}
