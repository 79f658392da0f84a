// Event sink executor: publishes a fired-job event on a NATS subject

use crate::errors::ExecutionError;
use crate::executor::JobExecutor;
use crate::models::{ExecutionResponse, JobDetails, Recipient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event published for every fire of a sink job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobFiredEvent {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub execution_counter: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub fired_at: DateTime<Utc>,
}

impl JobFiredEvent {
    pub fn from_job(job: &JobDetails, payload: Option<serde_json::Value>) -> Self {
        Self {
            job_id: job.id.clone(),
            correlation_id: job.correlation_id.clone(),
            execution_counter: job.execution_counter,
            payload,
            fired_at: Utc::now(),
        }
    }
}

/// SinkExecutor publishes fired-job events with core NATS
pub struct SinkExecutor {
    client: async_nats::Client,
}

impl SinkExecutor {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobExecutor for SinkExecutor {
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id))]
    async fn execute(&self, job: &JobDetails) -> Result<ExecutionResponse, ExecutionError> {
        let Recipient::Sink { subject, payload } = &job.recipient else {
            return Err(ExecutionError::UnsupportedRecipient(
                "SinkExecutor can only publish to sink recipients".to_string(),
            ));
        };

        let event = JobFiredEvent::from_job(job, payload.clone());
        let bytes = serde_json::to_vec(&event).map_err(|e| {
            ExecutionError::SinkPublishFailed(format!("Failed to serialize event: {}", e))
        })?;

        self.client
            .publish(subject.clone(), bytes.into())
            .await
            .map_err(|e| {
                ExecutionError::SinkPublishFailed(format!("Failed to publish to {}: {}", subject, e))
            })?;

        tracing::debug!(subject = %subject, "Fired-job event published");
        Ok(ExecutionResponse::new(
            job.id.clone(),
            200,
            format!("published to {}", subject),
            Utc::now(),
        ))
    }
}
