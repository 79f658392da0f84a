// HTTP callback executor

use crate::errors::ExecutionError;
use crate::executor::JobExecutor;
use crate::models::{ExecutionResponse, HttpMethod, JobDetails, Recipient};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method};
use std::time::Duration;

/// Header carrying the id of the fired job
pub const JOB_ID_HEADER: &str = "X-Job-Id";

/// HttpExecutor calls the recipient URL of a job
pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    /// Create a new HttpExecutor whose requests time out after
    /// `timeout_seconds` unless the job carries its own timeout
    pub fn new(timeout_seconds: u64) -> Result<Self, ExecutionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| {
                ExecutionError::HttpRequestFailed(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self { client })
    }

    fn convert_method(method: &HttpMethod) -> Method {
        match method {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
        }
    }
}

#[async_trait]
impl JobExecutor for HttpExecutor {
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id))]
    async fn execute(&self, job: &JobDetails) -> Result<ExecutionResponse, ExecutionError> {
        let Recipient::Http {
            url,
            method,
            headers,
            payload,
        } = &job.recipient
        else {
            return Err(ExecutionError::UnsupportedRecipient(
                "HttpExecutor can only call HTTP recipients".to_string(),
            ));
        };

        let reqwest_method = Self::convert_method(method);
        tracing::info!("Calling HTTP {} {}", reqwest_method, url);

        let mut request = self
            .client
            .request(reqwest_method, url)
            .header(JOB_ID_HEADER, &job.id);

        for (key, value) in headers {
            request = request.header(key, value);
        }
        if let Some(correlation_id) = &job.correlation_id {
            request = request.header("X-Correlation-Id", correlation_id);
        }
        if let Some(body) = payload {
            request = request.json(body);
        }

        let timeout = job.execution_timeout_duration();
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| match timeout {
            Some(timeout) if e.is_timeout() => ExecutionError::Timeout(timeout),
            _ => ExecutionError::HttpRequestFailed(format!("HTTP request failed: {}", e)),
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            ExecutionError::HttpRequestFailed(format!("Failed to read response body: {}", e))
        })?;
        tracing::info!(status_code = status.as_u16(), "HTTP callback answered");

        let message = if body.is_empty() {
            status.canonical_reason().unwrap_or("Unknown").to_string()
        } else {
            body
        };

        Ok(ExecutionResponse::new(
            job.id.clone(),
            status.as_u16(),
            message,
            Utc::now(),
        ))
    }
}
