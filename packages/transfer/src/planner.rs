//! Chunk planning under the S3 multipart constraints.

use replicator_models::ChunkRange;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Smallest part S3 accepts (except for the last part).
pub const MIN_PART_SIZE: u64 = 5 * MIB;

/// Largest number of parts in one multipart upload.
pub const MAX_PARTS: u64 = 10_000;

/// Default part size.
pub const DEFAULT_CHUNK_SIZE: u64 = 100 * MIB;

/// Errors raised while planning a transfer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// The part size is below [`MIN_PART_SIZE`].
    #[error("Chunk size {chunk_size} bytes too small; minimum is {MIN_PART_SIZE} bytes (5 MiB)")]
    InvalidChunkSize {
        /// Requested part size.
        chunk_size: u64,
    },

    /// The object needs more than [`MAX_PARTS`] parts.
    #[error(
        "Object too large ({total_size} bytes) for {chunk_size} byte chunks: \
         needs {parts} parts, max allowed is {max_object_size} bytes with {MAX_PARTS} parts"
    )]
    TooManyParts {
        /// Object size.
        total_size: u64,
        /// Requested part size.
        chunk_size: u64,
        /// Parts the object would need.
        parts: u64,
        /// Largest object this part size supports.
        max_object_size: u64,
    },
}

/// Number of parts needed for an object, validating the constraints.
///
/// A zero-byte object needs one (empty) part.
///
/// # Errors
///
/// Returns [`PlanError::InvalidChunkSize`] if `chunk_size` is below
/// [`MIN_PART_SIZE`], or [`PlanError::TooManyParts`] if the object needs
/// more than [`MAX_PARTS`] parts.
pub fn total_parts(total_size: u64, chunk_size: u64) -> Result<u32, PlanError> {
    if chunk_size < MIN_PART_SIZE {
        return Err(PlanError::InvalidChunkSize { chunk_size });
    }

    let parts = total_size.div_ceil(chunk_size).max(1);
    if parts > MAX_PARTS {
        return Err(PlanError::TooManyParts {
            total_size,
            chunk_size,
            parts,
            max_object_size: MAX_PARTS.saturating_mul(chunk_size),
        });
    }

    // MAX_PARTS fits in u32
    Ok(u32::try_from(parts).unwrap_or(u32::MAX))
}

/// Splits `[0, total_size)` into consecutive parts of `chunk_size` bytes
/// (the last one possibly shorter), numbered from 1.
///
/// # Errors
///
/// See [`total_parts`].
pub fn plan(total_size: u64, chunk_size: u64) -> Result<Vec<ChunkRange>, PlanError> {
    let count = total_parts(total_size, chunk_size)?;

    Ok((1..=count)
        .map(|part_number| {
            let start = u64::from(part_number - 1) * chunk_size;
            ChunkRange {
                part_number,
                start,
                length: chunk_size.min(total_size - start),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1_000_000;

    fn assert_covers(ranges: &[ChunkRange], total_size: u64, chunk_size: u64) {
        let mut expected_start = 0;
        for (i, range) in ranges.iter().enumerate() {
            assert_eq!(range.part_number as usize, i + 1);
            assert_eq!(range.start, expected_start);
            if i + 1 < ranges.len() {
                assert_eq!(range.length, chunk_size);
            }
            expected_start += range.length;
        }
        assert_eq!(expected_start, total_size);
    }

    #[test]
    fn splits_250_mb_into_three_parts() {
        let ranges = plan(250 * MB, 100 * MB).unwrap();
        let lengths: Vec<u64> = ranges.iter().map(|r| r.length).collect();
        assert_eq!(lengths, vec![100 * MB, 100 * MB, 50 * MB]);
        assert_eq!(ranges[2].end(), Some(250 * MB - 1));
        assert_covers(&ranges, 250 * MB, 100 * MB);
    }

    #[test]
    fn ranges_are_contiguous_for_many_sizes() {
        let chunk = MIN_PART_SIZE;
        for total in [1, chunk - 1, chunk, chunk + 1, 3 * chunk, 7 * chunk + 12_345] {
            let ranges = plan(total, chunk).unwrap();
            assert_eq!(ranges.len() as u64, total.div_ceil(chunk));
            assert_covers(&ranges, total, chunk);
        }
    }

    #[test]
    fn zero_byte_object_gets_one_empty_part() {
        let ranges = plan(0, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(
            ranges,
            vec![ChunkRange {
                part_number: 1,
                start: 0,
                length: 0
            }]
        );
        assert_eq!(total_parts(0, DEFAULT_CHUNK_SIZE).unwrap(), 1);
    }

    #[test]
    fn small_object_is_one_part() {
        let ranges = plan(42, DEFAULT_CHUNK_SIZE).unwrap();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].range_header().as_deref(), Some("bytes=0-41"));
    }

    #[test]
    fn rejects_chunks_below_5_mib() {
        assert_eq!(
            plan(100, MIN_PART_SIZE - 1),
            Err(PlanError::InvalidChunkSize {
                chunk_size: MIN_PART_SIZE - 1
            })
        );
        assert!(total_parts(0, 0).is_err());
    }

    #[test]
    fn rejects_more_than_10000_parts() {
        let chunk = MIN_PART_SIZE;
        assert_eq!(total_parts(MAX_PARTS * chunk, chunk).unwrap(), 10_000);

        let err = total_parts(MAX_PARTS * chunk + 1, chunk).unwrap_err();
        assert_eq!(
            err,
            PlanError::TooManyParts {
                total_size: MAX_PARTS * chunk + 1,
                chunk_size: chunk,
                parts: MAX_PARTS + 1,
                max_object_size: MAX_PARTS * chunk,
            }
        );
    }
}
