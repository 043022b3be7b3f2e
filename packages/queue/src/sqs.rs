//! SQS [`MessageQueue`].

use async_trait::async_trait;
use aws_config::SdkConfig;

use crate::{MessageQueue, QueueError, QueueFailure, ReceivedMessage};

/// SQS queue bound to one queue URL.
#[derive(Debug, Clone)]
pub struct SqsQueue {
    client: aws_sdk_sqs::Client,
    url: String,
}

impl SqsQueue {
    /// Connects to a queue given by name or URL.
    ///
    /// Names are resolved with `GetQueueUrl`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] with [`QueueFailure::NotFound`] if the queue
    /// does not exist.
    pub async fn connect(config: &SdkConfig, name_or_url: &str) -> Result<Self, QueueError> {
        let client = aws_sdk_sqs::Client::new(config);

        if name_or_url.starts_with("https://") || name_or_url.starts_with("http://") {
            return Ok(Self {
                client,
                url: name_or_url.to_string(),
            });
        }

        let output = client
            .get_queue_url()
            .queue_name(name_or_url)
            .send()
            .await
            .map_err(|e| QueueError::from_sdk("GetQueueUrl", name_or_url, e))?;

        let url = output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| QueueError::MissingField {
                operation: "GetQueueUrl",
                target: name_or_url.to_string(),
                field: "QueueUrl",
            })?;

        log::debug!("Resolved queue {name_or_url} to {url}");
        Ok(Self { client, url })
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    fn name(&self) -> &str {
        &self.url
    }

    async fn send(&self, body: &str) -> Result<(), QueueError> {
        self.client
            .send_message()
            .queue_url(&self.url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| QueueError::from_sdk("SendMessage", &self.url, e))?;
        Ok(())
    }

    async fn receive(&self) -> Result<Option<ReceivedMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.url)
            .max_number_of_messages(1)
            .visibility_timeout(0)
            .wait_time_seconds(0)
            .send()
            .await
            .map_err(|e| QueueError::from_sdk("ReceiveMessage", &self.url, e))?;

        let Some(message) = output.messages().first() else {
            return Ok(None);
        };

        let receipt_handle =
            message
                .receipt_handle()
                .ok_or_else(|| QueueError::MissingField {
                    operation: "ReceiveMessage",
                    target: self.url.clone(),
                    field: "ReceiptHandle",
                })?;

        Ok(Some(ReceivedMessage {
            body: message.body().unwrap_or_default().to_string(),
            receipt_handle: receipt_handle.to_string(),
        }))
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::from_sdk("DeleteMessage", &self.url, e))?;
        Ok(())
    }

    async fn purge(&self) -> Result<(), QueueError> {
        let result = self
            .client
            .purge_queue()
            .queue_url(&self.url)
            .send()
            .await;

        match result {
            Ok(_) => {
                log::info!("Purged queue {}", self.url);
                Ok(())
            }
            Err(e) => {
                let code = e.as_service_error().and_then(|s| {
                    aws_sdk_sqs::error::ProvideErrorMetadata::code(s).map(str::to_string)
                });
                // SQS allows one purge per minute; an earlier purge still
                // running empties the queue just the same.
                if matches!(
                    code.as_deref(),
                    Some("AWS.SimpleQueueService.PurgeQueueInProgress" | "PurgeQueueInProgress")
                ) {
                    log::warn!("Purge of {} already in progress", self.url);
                    return Ok(());
                }
                let err = QueueError::from_sdk("PurgeQueue", &self.url, e);
                if err.kind() == QueueFailure::NotFound {
                    log::error!("Queue {} does not exist", self.url);
                }
                Err(err)
            }
        }
    }
}
