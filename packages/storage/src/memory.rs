//! In-memory [`ObjectStore`].
//!
//! Behaves like S3 for the operations the jobs use, including multipart
//! `ETag`s (`<md5 of part md5s>-<n>`), and records every call so tests can
//! assert on what happened. Failures are injected per operation with
//! [`MemoryStore::fail_next`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt as _;
use replicator_models::{ChunkRange, PartCompletion};

use crate::{FailureKind, ObjectBody, ObjectStore, Operation, RemoteMeta, StorageError};

/// Chunk size of streamed bodies.
const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    e_tag: String,
}

#[derive(Debug)]
struct Upload {
    bucket: String,
    key: String,
    parts: BTreeMap<u32, (String, Bytes)>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<(String, String), StoredObject>,
    uploads: HashMap<String, Upload>,
    next_upload: u64,
    completed: Vec<String>,
    aborted: Vec<String>,
    calls: HashMap<Operation, usize>,
    failures: HashMap<Operation, (FailureKind, usize)>,
}

/// Thread-safe in-memory object store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores an object as if written by a single `PutObject`.
    pub fn insert(&self, bucket: &str, key: &str, body: Bytes) {
        let e_tag = format!("\"{:x}\"", md5::compute(&body));
        self.lock().objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject { body, e_tag },
        );
    }

    /// Makes the next `count` calls of `operation` fail with `kind`.
    pub fn fail_next(&self, operation: Operation, kind: FailureKind, count: usize) {
        self.lock().failures.insert(operation, (kind, count));
    }

    /// Contents of an object.
    #[must_use]
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.body.clone())
    }

    /// Number of calls made to `operation`, failed ones included.
    #[must_use]
    pub fn calls(&self, operation: Operation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Upload ids that were completed.
    #[must_use]
    pub fn completed_uploads(&self) -> Vec<String> {
        self.lock().completed.clone()
    }

    /// Upload ids that were aborted.
    #[must_use]
    pub fn aborted_uploads(&self) -> Vec<String> {
        self.lock().aborted.clone()
    }

    /// Number of multipart uploads neither completed nor aborted.
    #[must_use]
    pub fn open_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    /// Counts the call and consumes an injected failure, if any.
    fn enter(&self, operation: Operation, bucket: &str, key: &str) -> Result<(), StorageError> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_default() += 1;

        let Some((kind, remaining)) = state.failures.get_mut(&operation) else {
            return Ok(());
        };
        if *remaining == 0 {
            return Ok(());
        }
        *remaining -= 1;
        let kind = *kind;

        Err(request_error(operation, bucket, key, kind, "injected failure"))
    }
}

fn request_error(
    operation: Operation,
    bucket: &str,
    key: &str,
    kind: FailureKind,
    message: &str,
) -> StorageError {
    StorageError::Request {
        operation,
        bucket: bucket.to_string(),
        key: key.to_string(),
        kind,
        source: message.to_string().into(),
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<RemoteMeta>, StorageError> {
        self.enter(Operation::HeadObject, bucket, key)?;
        Ok(self
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| RemoteMeta {
                size: o.body.len() as u64,
                e_tag: Some(o.e_tag.clone()),
            }))
    }

    async fn create_multipart(&self, bucket: &str, key: &str) -> Result<String, StorageError> {
        self.enter(Operation::CreateMultipartUpload, bucket, key)?;
        let mut state = self.lock();
        state.next_upload += 1;
        let upload_id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            Upload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StorageError> {
        self.enter(Operation::UploadPart, bucket, key)?;
        let mut state = self.lock();
        let upload = state.uploads.get_mut(upload_id).ok_or_else(|| {
            request_error(
                Operation::UploadPart,
                bucket,
                key,
                FailureKind::NotFound,
                "NoSuchUpload",
            )
        })?;
        let e_tag = format!("\"{:x}\"", md5::compute(&body));
        upload.parts.insert(part_number, (e_tag.clone(), body));
        Ok(e_tag)
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartCompletion],
    ) -> Result<(), StorageError> {
        self.enter(Operation::CompleteMultipartUpload, bucket, key)?;
        let mut state = self.lock();
        let invalid = |message| {
            request_error(
                Operation::CompleteMultipartUpload,
                bucket,
                key,
                FailureKind::Permanent,
                message,
            )
        };

        let upload = state.uploads.get(upload_id).ok_or_else(|| {
            request_error(
                Operation::CompleteMultipartUpload,
                bucket,
                key,
                FailureKind::NotFound,
                "NoSuchUpload",
            )
        })?;
        if parts.is_empty() {
            return Err(invalid("MalformedXML"));
        }
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Err(invalid("InvalidPartOrder"));
        }

        let mut body = Vec::new();
        let mut digests = Vec::new();
        for part in parts {
            let (e_tag, bytes) = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| invalid("InvalidPart"))?;
            if *e_tag != part.e_tag {
                return Err(invalid("InvalidPart"));
            }
            body.extend_from_slice(bytes);
            digests.extend_from_slice(&md5::compute(bytes).0);
        }
        let e_tag = format!("\"{:x}-{}\"", md5::compute(&digests), parts.len());
        let location = (upload.bucket.clone(), upload.key.clone());

        state.uploads.remove(upload_id);
        state.completed.push(upload_id.to_string());
        state.objects.insert(
            location,
            StoredObject {
                body: Bytes::from(body),
                e_tag,
            },
        );
        Ok(())
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StorageError> {
        self.enter(Operation::AbortMultipartUpload, bucket, key)?;
        let mut state = self.lock();
        state.uploads.remove(upload_id);
        state.aborted.push(upload_id.to_string());
        Ok(())
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.enter(Operation::ListObjects, bucket, prefix)?;
        Ok(self
            .lock()
            .objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectBody, StorageError> {
        self.enter(Operation::GetObject, bucket, key)?;
        let body = self.object(bucket, key).ok_or_else(|| {
            request_error(
                Operation::GetObject,
                bucket,
                key,
                FailureKind::NotFound,
                "NoSuchKey",
            )
        })?;

        let chunks: Vec<Result<Bytes, StorageError>> = (0..body.len())
            .step_by(STREAM_CHUNK)
            .map(|start| Ok(body.slice(start..body.len().min(start + STREAM_CHUNK))))
            .collect();

        Ok(ObjectBody {
            content_length: Some(body.len() as u64),
            chunks: futures::stream::iter(chunks).boxed(),
        })
    }

    async fn get_range(
        &self,
        bucket: &str,
        key: &str,
        range: &ChunkRange,
    ) -> Result<Bytes, StorageError> {
        self.enter(Operation::GetObject, bucket, key)?;
        let body = self.object(bucket, key).ok_or_else(|| {
            request_error(
                Operation::GetObject,
                bucket,
                key,
                FailureKind::NotFound,
                "NoSuchKey",
            )
        })?;

        let start = usize::try_from(range.start).unwrap_or(usize::MAX);
        let length = usize::try_from(range.length).unwrap_or(usize::MAX);
        if start.saturating_add(length) > body.len() {
            return Err(request_error(
                Operation::GetObject,
                bucket,
                key,
                FailureKind::Permanent,
                "InvalidRange",
            ));
        }
        Ok(body.slice(start..start + length))
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<(), StorageError> {
        self.enter(Operation::PutObject, bucket, key)?;
        self.insert(bucket, key, body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt as _;

    use super::*;

    #[tokio::test]
    async fn ranged_reads_slice_the_object() {
        let store = MemoryStore::new();
        store.insert("b", "k", Bytes::from_static(b"hello world"));

        let range = ChunkRange {
            part_number: 2,
            start: 6,
            length: 5,
        };
        assert_eq!(store.get_range("b", "k", &range).await.unwrap(), "world");

        let past_end = ChunkRange {
            part_number: 3,
            start: 8,
            length: 5,
        };
        assert!(store.get_range("b", "k", &past_end).await.is_err());
        assert_eq!(store.calls(Operation::GetObject), 2);
    }

    #[tokio::test]
    async fn multipart_upload_assembles_parts_in_order() {
        let store = MemoryStore::new();
        let id = store.create_multipart("b", "k").await.unwrap();
        let tag2 = store
            .upload_part("b", "k", &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let tag1 = store
            .upload_part("b", "k", &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();

        let parts = [
            PartCompletion {
                part_number: 1,
                e_tag: tag1,
                byte_count: 6,
            },
            PartCompletion {
                part_number: 2,
                e_tag: tag2,
                byte_count: 5,
            },
        ];
        store.complete_multipart("b", "k", &id, &parts).await.unwrap();

        assert_eq!(store.object("b", "k").unwrap(), "hello world");
        let head = store.head("b", "k").await.unwrap().unwrap();
        assert!(head.e_tag.unwrap().ends_with("-2\""));
        assert_eq!(store.open_uploads(), 0);
        assert_eq!(store.completed_uploads(), vec![id]);
    }

    #[tokio::test]
    async fn unsorted_completion_is_rejected() {
        let store = MemoryStore::new();
        let id = store.create_multipart("b", "k").await.unwrap();
        let mut parts = Vec::new();
        for n in [1, 2] {
            let e_tag = store
                .upload_part("b", "k", &id, n, Bytes::from_static(b"x"))
                .await
                .unwrap();
            parts.push(PartCompletion {
                part_number: n,
                e_tag,
                byte_count: 1,
            });
        }
        parts.reverse();
        assert!(store.complete_multipart("b", "k", &id, &parts).await.is_err());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next(Operation::HeadObject, FailureKind::Transient, 1);
        assert!(store.head("b", "k").await.is_err());
        assert!(store.head("b", "k").await.unwrap().is_none());
        assert_eq!(store.calls(Operation::HeadObject), 2);
    }

    #[tokio::test]
    async fn get_streams_the_whole_body() {
        let store = MemoryStore::new();
        let data = Bytes::from(vec![7u8; STREAM_CHUNK * 2 + 3]);
        store.insert("b", "k", data.clone());

        let body = store.get("b", "k").await.unwrap();
        assert_eq!(body.content_length, Some(data.len() as u64));
        let chunks: Vec<Bytes> = body.chunks.try_collect().await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), data.to_vec());
    }

    #[tokio::test]
    async fn lists_keys_by_prefix() {
        let store = MemoryStore::new();
        store.insert("b", "a/1", Bytes::new());
        store.insert("b", "a/2", Bytes::new());
        store.insert("b", "c/3", Bytes::new());
        store.insert("other", "a/4", Bytes::new());
        assert_eq!(store.list_keys("b", "a/").await.unwrap(), vec!["a/1", "a/2"]);
        assert_eq!(store.list_keys("b", "").await.unwrap().len(), 3);
    }
}
