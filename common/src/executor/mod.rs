// Executor module for fired jobs
// Provides the trait and one implementation per recipient kind

pub mod http;
pub mod sink;

pub use http::HttpExecutor;
pub use sink::{JobFiredEvent, SinkExecutor};

use crate::errors::ExecutionError;
use crate::models::{ExecutionResponse, JobDetails, Recipient};
use async_trait::async_trait;
use std::sync::Arc;

/// JobExecutor delivers one fire of a job to its recipient.
///
/// A delivered call with a non-2xx status is an `Ok` response; `Err` means
/// the recipient could not be reached at all.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &JobDetails) -> Result<ExecutionResponse, ExecutionError>;
}

/// Routes each job to the executor of its recipient kind
pub struct RecipientExecutor {
    http: Arc<dyn JobExecutor>,
    sink: Option<Arc<dyn JobExecutor>>,
}

impl RecipientExecutor {
    pub fn new(http: Arc<dyn JobExecutor>, sink: Option<Arc<dyn JobExecutor>>) -> Self {
        Self { http, sink }
    }
}

#[async_trait]
impl JobExecutor for RecipientExecutor {
    async fn execute(&self, job: &JobDetails) -> Result<ExecutionResponse, ExecutionError> {
        match &job.recipient {
            Recipient::Http { .. } => self.http.execute(job).await,
            Recipient::Sink { subject, .. } => match &self.sink {
                Some(sink) => sink.execute(job).await,
                None => Err(ExecutionError::UnsupportedRecipient(format!(
                    "no event sink configured for subject {}",
                    subject
                ))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::Trigger;
    use chrono::Utc;

    struct Fixed(u16);

    #[async_trait]
    impl JobExecutor for Fixed {
        async fn execute(&self, job: &JobDetails) -> Result<ExecutionResponse, ExecutionError> {
            Ok(ExecutionResponse::new(job.id.clone(), self.0, "fixed", Utc::now()))
        }
    }

    fn job(recipient: Recipient) -> JobDetails {
        JobDetails::new("job-1", Trigger::point_in_time(Utc::now()), recipient)
    }

    #[tokio::test]
    async fn test_routes_by_recipient() {
        let executor = RecipientExecutor::new(Arc::new(Fixed(200)), Some(Arc::new(Fixed(202))));

        let http = job(Recipient::Http {
            url: "http://localhost/cb".to_string(),
            method: Default::default(),
            headers: Default::default(),
            payload: None,
        });
        assert_eq!(executor.execute(&http).await.unwrap().status_code, 200);

        let sink = job(Recipient::Sink {
            subject: "jobs.fired".to_string(),
            payload: None,
        });
        assert_eq!(executor.execute(&sink).await.unwrap().status_code, 202);
    }

    #[tokio::test]
    async fn test_sink_without_executor_is_unsupported() {
        let executor = RecipientExecutor::new(Arc::new(Fixed(200)), None);
        let sink = job(Recipient::Sink {
            subject: "jobs.fired".to_string(),
            payload: None,
        });

        let err = executor.execute(&sink).await.unwrap_err();
        assert!(matches!(err, ExecutionError::UnsupportedRecipient(_)));
    }
}
