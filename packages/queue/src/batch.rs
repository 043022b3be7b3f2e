//! AWS Batch [`JobQueue`].

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_batch::types::{ContainerOverrides, KeyValuePair};

use crate::{JobQueue, JobRequest, QueueError};

/// AWS Batch client.
#[derive(Debug, Clone)]
pub struct BatchJobQueue {
    client: aws_sdk_batch::Client,
}

impl BatchJobQueue {
    /// Creates a client from a loaded SDK configuration.
    #[must_use]
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_batch::Client::new(config),
        }
    }
}

#[async_trait]
impl JobQueue for BatchJobQueue {
    async fn submit(&self, request: &JobRequest) -> Result<(), QueueError> {
        let environment = request
            .environment
            .iter()
            .map(|(name, value)| KeyValuePair::builder().name(name).value(value).build())
            .collect();

        self.client
            .submit_job()
            .job_name(&request.job_name)
            .job_queue(&request.job_queue)
            .job_definition(&request.job_definition)
            .container_overrides(
                ContainerOverrides::builder()
                    .set_environment(Some(environment))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| QueueError::from_sdk("SubmitJob", &request.job_queue, e))?;

        Ok(())
    }
}
