//! Destination existence and integrity check.

use crate::ObjectStore;

/// Result of checking a destination object against expectations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistenceCheck {
    /// Present with the expected size (and checksum, when comparable).
    Exists,
    /// Present with a different size.
    SizeMismatch {
        /// Expected size in bytes.
        expected: u64,
        /// Size found at the destination.
        actual: u64,
    },
    /// Present with the expected size but a different MD5.
    ChecksumMismatch {
        /// Expected MD5.
        expected: String,
        /// MD5 found at the destination.
        actual: String,
    },
    /// Absent.
    NotFound,
    /// The check itself failed (transport, permissions, ...).
    CheckError {
        /// Error text.
        message: String,
    },
}

impl ExistenceCheck {
    /// Whether the object can be skipped.
    #[must_use]
    pub const fn is_satisfied(&self) -> bool {
        matches!(self, Self::Exists)
    }
}

impl std::fmt::Display for ExistenceCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exists => f.write_str("exists"),
            Self::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch (expected {expected}, found {actual})")
            }
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch (expected {expected}, found {actual})")
            }
            Self::NotFound => f.write_str("not found"),
            Self::CheckError { message } => write!(f, "check failed: {message}"),
        }
    }
}

/// Checks whether `s3://bucket/key` already holds the expected object.
///
/// 1. Absent → [`ExistenceCheck::NotFound`].
/// 2. Size differs → [`ExistenceCheck::SizeMismatch`].
/// 3. Size matches and both an expected MD5 and a single-part `ETag` are
///    available → compare them.
/// 4. Otherwise (no checksum, or multipart `ETag`) the size match alone
///    gives [`ExistenceCheck::Exists`].
///
/// Never fails; errors are reported as [`ExistenceCheck::CheckError`].
pub async fn check(
    store: &dyn ObjectStore,
    bucket: &str,
    key: &str,
    expected_size: u64,
    expected_md5: Option<&str>,
) -> ExistenceCheck {
    let remote = match store.head(bucket, key).await {
        Ok(Some(remote)) => remote,
        Ok(None) => return ExistenceCheck::NotFound,
        Err(e) => {
            return ExistenceCheck::CheckError {
                message: e.to_string(),
            };
        }
    };

    if remote.size != expected_size {
        return ExistenceCheck::SizeMismatch {
            expected: expected_size,
            actual: remote.size,
        };
    }

    if let (Some(expected), Some(actual)) = (expected_md5, remote.md5())
        && !expected.eq_ignore_ascii_case(actual)
    {
        return ExistenceCheck::ChecksumMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        };
    }

    ExistenceCheck::Exists
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::memory::MemoryStore;
    use crate::{FailureKind, Operation};

    const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert("bucket", "guid/a.bam", Bytes::from_static(b"hello"));
        store.insert("bucket", "guid/empty", Bytes::new());
        store
    }

    #[tokio::test]
    async fn absent_object_is_not_found() {
        let result = check(&store(), "bucket", "guid/missing", 5, None).await;
        assert_eq!(result, ExistenceCheck::NotFound);
    }

    #[tokio::test]
    async fn matching_size_without_checksum_exists() {
        let result = check(&store(), "bucket", "guid/a.bam", 5, None).await;
        assert_eq!(result, ExistenceCheck::Exists);
        assert!(result.is_satisfied());
    }

    #[tokio::test]
    async fn different_size_is_a_mismatch() {
        let result = check(&store(), "bucket", "guid/a.bam", 6, None).await;
        assert_eq!(
            result,
            ExistenceCheck::SizeMismatch {
                expected: 6,
                actual: 5
            }
        );
    }

    #[tokio::test]
    async fn compares_single_part_etag_with_checksum() {
        let store = store();
        assert_eq!(
            check(&store, "bucket", "guid/empty", 0, Some(EMPTY_MD5)).await,
            ExistenceCheck::Exists
        );
        assert!(matches!(
            check(&store, "bucket", "guid/a.bam", 5, Some(EMPTY_MD5)).await,
            ExistenceCheck::ChecksumMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn head_failure_is_a_check_error() {
        let store = store();
        store.fail_next(Operation::HeadObject, FailureKind::AccessDenied, 1);
        let result = check(&store, "bucket", "guid/a.bam", 5, None).await;
        assert!(matches!(result, ExistenceCheck::CheckError { .. }));
        assert!(!result.is_satisfied());
    }
}
