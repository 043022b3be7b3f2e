//! In-memory [`JobQueue`] and [`MessageQueue`].
//!
//! Both record what they were asked to do and accept injected failures so
//! tests can drive the error paths of the dispatcher and the jobs.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::{JobQueue, JobRequest, MessageQueue, QueueError, QueueFailure, ReceivedMessage};

fn injected(operation: &'static str, target: &str, kind: QueueFailure) -> QueueError {
    QueueError::Request {
        operation,
        target: target.to_string(),
        kind,
        source: format!("injected {kind} failure").into(),
    }
}

/// A failure that applies to jobs whose environment contains `name=value`.
#[derive(Debug)]
struct JobFailure {
    name: String,
    value: String,
    kind: QueueFailure,
    remaining: usize,
}

#[derive(Debug, Default)]
struct JobState {
    submitted: Vec<JobRequest>,
    attempts: usize,
    failures: Vec<JobFailure>,
    fail_all: Option<QueueFailure>,
}

/// Job queue that accepts every submission unless told otherwise.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    state: Mutex<JobState>,
}

impl MemoryJobQueue {
    /// Creates an empty job queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `count` submissions of jobs with `name=value` in
    /// their environment fail with `kind`.
    pub fn fail_job(&self, name: &str, value: &str, kind: QueueFailure, count: usize) {
        self.lock().failures.push(JobFailure {
            name: name.to_string(),
            value: value.to_string(),
            kind,
            remaining: count,
        });
    }

    /// Makes every submission fail with `kind`.
    pub fn fail_all(&self, kind: QueueFailure) {
        self.lock().fail_all = Some(kind);
    }

    /// Accepted submissions, in acceptance order.
    #[must_use]
    pub fn submitted(&self) -> Vec<JobRequest> {
        self.lock().submitted.clone()
    }

    /// Number of submission attempts, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn submit(&self, request: &JobRequest) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.attempts += 1;

        if let Some(kind) = state.fail_all {
            return Err(injected("SubmitJob", &request.job_queue, kind));
        }

        let failure = state.failures.iter_mut().find(|f| {
            f.remaining > 0 && request.environment.get(&f.name) == Some(&f.value)
        });
        if let Some(failure) = failure {
            failure.remaining -= 1;
            return Err(injected("SubmitJob", &request.job_queue, failure.kind));
        }

        state.submitted.push(request.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MessageState {
    messages: VecDeque<ReceivedMessage>,
    next_receipt: u64,
    sent: usize,
    receive_calls: usize,
    purges: usize,
    send_failures: Option<(QueueFailure, usize)>,
    receive_failures: Option<(QueueFailure, usize)>,
}

fn take_failure(slot: &mut Option<(QueueFailure, usize)>) -> Option<QueueFailure> {
    let (kind, remaining) = slot.as_mut()?;
    if *remaining == 0 {
        return None;
    }
    *remaining -= 1;
    Some(*kind)
}

/// Message queue whose received messages stay visible until deleted.
#[derive(Debug)]
pub struct MemoryMessageQueue {
    name: String,
    exists: bool,
    state: Mutex<MessageState>,
}

impl MemoryMessageQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            exists: true,
            state: Mutex::default(),
        }
    }

    /// A queue whose every call fails with [`QueueFailure::NotFound`].
    #[must_use]
    pub fn missing(name: &str) -> Self {
        Self {
            exists: false,
            ..Self::new(name)
        }
    }

    fn lock(&self) -> MutexGuard<'_, MessageState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_exists(&self, operation: &'static str) -> Result<(), QueueError> {
        if self.exists {
            Ok(())
        } else {
            Err(injected(operation, &self.name, QueueFailure::NotFound))
        }
    }

    /// Makes the next `count` sends fail with `kind`.
    pub fn fail_next_send(&self, kind: QueueFailure, count: usize) {
        self.lock().send_failures = Some((kind, count));
    }

    /// Makes the next `count` receives fail with `kind`.
    pub fn fail_next_receive(&self, kind: QueueFailure, count: usize) {
        self.lock().receive_failures = Some((kind, count));
    }

    /// Bodies of the messages still in the queue.
    #[must_use]
    pub fn bodies(&self) -> Vec<String> {
        self.lock().messages.iter().map(|m| m.body.clone()).collect()
    }

    /// Number of messages still in the queue.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of messages accepted by [`MessageQueue::send`].
    #[must_use]
    pub fn sent(&self) -> usize {
        self.lock().sent
    }

    /// Number of receive calls, failed ones included.
    #[must_use]
    pub fn receive_calls(&self) -> usize {
        self.lock().receive_calls
    }

    /// Number of purges.
    #[must_use]
    pub fn purges(&self) -> usize {
        self.lock().purges
    }
}

#[async_trait]
impl MessageQueue for MemoryMessageQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: &str) -> Result<(), QueueError> {
        self.ensure_exists("SendMessage")?;
        let mut state = self.lock();
        if let Some(kind) = take_failure(&mut state.send_failures) {
            return Err(injected("SendMessage", &self.name, kind));
        }

        state.next_receipt += 1;
        let receipt_handle = format!("receipt-{}", state.next_receipt);
        state.messages.push_back(ReceivedMessage {
            body: body.to_string(),
            receipt_handle,
        });
        state.sent += 1;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<ReceivedMessage>, QueueError> {
        self.ensure_exists("ReceiveMessage")?;
        let mut state = self.lock();
        state.receive_calls += 1;
        if let Some(kind) = take_failure(&mut state.receive_failures) {
            return Err(injected("ReceiveMessage", &self.name, kind));
        }
        Ok(state.messages.front().cloned())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.ensure_exists("DeleteMessage")?;
        self.lock()
            .messages
            .retain(|m| m.receipt_handle != receipt_handle);
        Ok(())
    }

    async fn purge(&self) -> Result<(), QueueError> {
        self.ensure_exists("PurgeQueue")?;
        let mut state = self.lock();
        state.messages.clear();
        state.purges += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn request(key: &str) -> JobRequest {
        JobRequest {
            job_name: "gdc_copy".to_string(),
            job_queue: "queue".to_string(),
            job_definition: "definition".to_string(),
            environment: BTreeMap::from([("KEY".to_string(), key.to_string())]),
        }
    }

    #[tokio::test]
    async fn job_failures_apply_to_matching_jobs_only() {
        let queue = MemoryJobQueue::new();
        queue.fail_job("KEY", "b", QueueFailure::Rejected, 1);

        queue.submit(&request("a")).await.unwrap();
        let err = queue.submit(&request("b")).await.unwrap_err();
        assert_eq!(err.kind(), QueueFailure::Rejected);
        queue.submit(&request("b")).await.unwrap();

        assert_eq!(queue.attempts(), 3);
        assert_eq!(queue.submitted().len(), 2);
    }

    #[tokio::test]
    async fn received_messages_stay_until_deleted() {
        let queue = MemoryMessageQueue::new("results");
        queue.send("a").await.unwrap();

        let first = queue.receive().await.unwrap().unwrap();
        let again = queue.receive().await.unwrap().unwrap();
        assert_eq!(first, again);

        queue.delete(&first.receipt_handle).await.unwrap();
        assert!(queue.receive().await.unwrap().is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn missing_queue_fails_every_call() {
        let queue = MemoryMessageQueue::missing("gone");
        assert_eq!(
            queue.purge().await.unwrap_err().kind(),
            QueueFailure::NotFound
        );
        assert_eq!(
            queue.send("x").await.unwrap_err().kind(),
            QueueFailure::NotFound
        );
    }

    #[tokio::test]
    async fn purge_empties_the_queue() {
        let queue = MemoryMessageQueue::new("results");
        queue.send("a").await.unwrap();
        queue.send("b").await.unwrap();

        queue.purge().await.unwrap();

        assert!(queue.is_empty());
        assert_eq!(queue.purges(), 1);
        assert_eq!(queue.sent(), 2);
    }
}
