//! Collecting worker results from a [`MessageQueue`].

use replicator_retry::{RetryPolicy, Retryable, retry};

use crate::{MessageQueue, QueueError};

/// Result of [`drain`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    /// Message bodies, in receive order.
    pub messages: Vec<String>,
    /// `false` if the queue stayed empty for the whole idle budget before
    /// `expected` messages arrived.
    pub complete: bool,
}

/// One poll of the results queue.
#[derive(Debug)]
enum PollError {
    /// Nothing to receive.
    Empty,
    /// Receive failed.
    Queue(QueueError),
}

impl std::fmt::Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("queue empty"),
            Self::Queue(e) => e.fmt(f),
        }
    }
}

impl Retryable for PollError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Queue(e) => e.is_retryable(),
        }
    }
}

/// Receives and deletes messages one at a time until `expected` have been
/// collected.
///
/// Each message is awaited through [`retry`] with the `idle` policy: an
/// empty poll waits `idle.delay(n)` before polling again, and after
/// `idle.max_attempts` consecutive empty polls the drain gives up and
/// returns what it has with `complete == false`. Transient receive errors
/// count as empty polls.
///
/// # Errors
///
/// Returns [`QueueError`] on a non-retryable receive error or if a
/// received message cannot be deleted.
pub async fn drain(
    queue: &dyn MessageQueue,
    expected: usize,
    idle: &RetryPolicy,
) -> Result<DrainOutcome, QueueError> {
    let mut messages = Vec::with_capacity(expected);
    let delete_policy = RetryPolicy::transfer();
    let label = format!("poll {}", queue.name());

    while messages.len() < expected {
        let polled = retry(idle, &label, |_| async move {
            match queue.receive().await {
                Ok(Some(message)) => Ok(message),
                Ok(None) => Err(PollError::Empty),
                Err(e) => Err(PollError::Queue(e)),
            }
        })
        .await;

        let message = match polled {
            Ok(message) => message,
            Err(PollError::Queue(e)) if !e.is_retryable() => return Err(e),
            Err(_) => {
                log::warn!(
                    "Gave up on {} with {}/{expected} messages",
                    queue.name(),
                    messages.len()
                );
                return Ok(DrainOutcome {
                    messages,
                    complete: false,
                });
            }
        };

        retry(&delete_policy, "delete message", |_| {
            queue.delete(&message.receipt_handle)
        })
        .await?;
        messages.push(message.body);

        if messages.len() % 100 == 0 {
            log::info!("Received {}/{expected} messages", messages.len());
        }
    }

    log::info!("Received all {expected} messages from {}", queue.name());
    Ok(DrainOutcome {
        messages,
        complete: true,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::QueueFailure;
    use crate::memory::MemoryMessageQueue;

    #[tokio::test]
    async fn collects_and_deletes_expected_messages() {
        let queue = MemoryMessageQueue::new("results");
        for i in 0..3 {
            queue.send(&format!("m{i}")).await.unwrap();
        }

        let outcome = drain(&queue, 3, &RetryPolicy::immediate(3)).await.unwrap();

        assert!(outcome.complete);
        assert_eq!(outcome.messages, vec!["m0", "m1", "m2"]);
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn stops_at_expected_count() {
        let queue = MemoryMessageQueue::new("results");
        for i in 0..5 {
            queue.send(&format!("m{i}")).await.unwrap();
        }

        let outcome = drain(&queue, 2, &RetryPolicy::immediate(3)).await.unwrap();

        assert!(outcome.complete);
        assert_eq!(outcome.messages.len(), 2);
        assert_eq!(queue.len(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_idle_budget() {
        let queue = MemoryMessageQueue::new("results");
        queue.send("only").await.unwrap();

        let outcome = drain(&queue, 2, &RetryPolicy::immediate(4)).await.unwrap();

        assert!(!outcome.complete);
        assert_eq!(outcome.messages, vec!["only"]);
        assert_eq!(queue.receive_calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_late_messages() {
        let queue = Arc::new(MemoryMessageQueue::new("results"));
        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(25)).await;
                queue.send("late").await.unwrap();
            })
        };

        let idle = RetryPolicy::new(10, Duration::from_secs(10), Duration::from_secs(10));
        let outcome = drain(queue.as_ref(), 1, &idle).await.unwrap();
        producer.await.unwrap();

        assert!(outcome.complete);
        assert_eq!(outcome.messages, vec!["late"]);
    }

    #[tokio::test]
    async fn transient_receive_errors_count_as_idle() {
        let queue = MemoryMessageQueue::new("results");
        queue.send("m").await.unwrap();
        queue.fail_next_receive(QueueFailure::Throttled, 2);

        let outcome = drain(&queue, 1, &RetryPolicy::immediate(5)).await.unwrap();

        assert!(outcome.complete);
        assert_eq!(outcome.messages, vec!["m"]);
    }

    #[tokio::test]
    async fn persistent_receive_errors_end_the_drain_incomplete() {
        let queue = MemoryMessageQueue::new("results");
        queue.send("m").await.unwrap();
        queue.fail_next_receive(QueueFailure::Transient, 3);

        let outcome = drain(&queue, 1, &RetryPolicy::immediate(3)).await.unwrap();

        assert!(!outcome.complete);
        assert!(outcome.messages.is_empty());
        assert_eq!(queue.receive_calls(), 3);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn permission_denied_aborts_the_drain() {
        let queue = MemoryMessageQueue::new("results");
        queue.send("m").await.unwrap();
        queue.fail_next_receive(QueueFailure::PermissionDenied, 1);

        let err = drain(&queue, 1, &RetryPolicy::immediate(5))
            .await
            .unwrap_err();

        assert!(err.is_permission_denied());
    }
}
