//! HTTP implementation of the server protocol.
//!
//! Lifecycle messages travel inside a common envelope carrying a fresh
//! message id, a timestamp and the sending node's identity; job
//! requests post a bare body and read the assignment list out of the
//! response. All bodies are JSON.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use crate::job::{truncate_text, JobResult, JobSpec, JobStatus, TEXT_PREVIEW_LIMIT};

use super::{HeartbeatPayload, RegistrationPayload, ServerTransport, TransportError};

/// Request body for `/api/jobs/request`. Sent bare, without envelope.
#[derive(Debug, Serialize)]
struct JobRequest<'a> {
    node_id: &'a str,
    capacity: usize,
    capabilities: &'a [String],
}

#[derive(Debug, Deserialize)]
struct JobsResponse {
    #[serde(default)]
    jobs: Vec<JobSpec>,
}

/// `ServerTransport` over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpServerClient {
    http: reqwest::Client,
    base_url: String,
    node_id: String,
    capabilities: Vec<String>,
}

impl HttpServerClient {
    /// Builds a client for the server at `server_url`.
    ///
    /// `capabilities` is advertised with every job request so the
    /// server only assigns work this node can run.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidUrl` when `server_url` does not
    /// parse, or `TransportError::Request` when the underlying client
    /// cannot be constructed.
    pub fn new(
        server_url: &str,
        node_id: impl Into<String>,
        capabilities: Vec<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let parsed = Url::parse(server_url)?;
        let http = reqwest::Client::builder()
            .user_agent(format!("farmhand/{}", crate::VERSION))
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            node_id: node_id.into(),
            capabilities,
        })
    }

    /// The node id this client reports as.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Wraps a payload in the message envelope the server expects.
    fn envelope(&self, message_type: &str, payload: Value) -> Value {
        json!({
            "message_id": Uuid::new_v4().to_string(),
            "message_type": message_type,
            "timestamp": Utc::now().to_rfc3339(),
            "sender": {
                "id": self.node_id,
                "type": "node_agent",
            },
            "payload": payload,
        })
    }

    fn status_payload(&self, job_id: &str, status: JobStatus, progress: u8) -> Value {
        let percent = f64::from(progress);
        json!({
            "job_id": job_id,
            "node_id": self.node_id,
            "status": status,
            "progress": progress,
            "status_message": format!("Job {} at {percent:.1}%", status.as_str()),
        })
    }

    /// Assembles the final-result payload.
    ///
    /// Long extracted text is cut down before shipping; the full text
    /// already lives in the job's output file, the payload only carries
    /// a preview.
    fn result_payload(&self, job_id: &str, result: &JobResult) -> Value {
        let mut payload = json!({
            "job_id": job_id,
            "node_id": self.node_id,
            "status": result.status,
            "result": result.result.clone().unwrap_or_else(|| json!({})),
            "processing_stats": result.processing_stats,
        });

        if let Some(error) = &result.error {
            payload["error"] = json!({
                "message": error.message,
                "details": error.details,
            });
        }

        let preview = payload["result"]["text_content"]
            .as_str()
            .filter(|text| text.chars().count() > TEXT_PREVIEW_LIMIT)
            .map(|text| truncate_text(text, TEXT_PREVIEW_LIMIT));
        if let Some(text) = preview {
            payload["result"]["text_content"] = Value::String(text);
        }

        payload
    }

    /// Posts `body` to `path` and maps non-2xx answers to errors.
    async fn post_json(&self, path: &str, body: &Value) -> Result<reqwest::Response, TransportError> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "posting to job server");

        let response = self.http.post(&url).json(body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ServerTransport for HttpServerClient {
    async fn register_node(
        &self,
        registration: &RegistrationPayload,
    ) -> Result<(), TransportError> {
        let payload = serde_json::to_value(registration)?;
        let message = self.envelope("node_registration", payload);
        self.post_json("/api/nodes/register", &message).await?;
        info!(node_id = %self.node_id, "node registered with server");
        Ok(())
    }

    async fn send_heartbeat(&self, heartbeat: &HeartbeatPayload) -> Result<(), TransportError> {
        let payload = serde_json::to_value(heartbeat)?;
        let message = self.envelope("node_heartbeat", payload);
        let path = format!("/api/nodes/{}/heartbeat", self.node_id);
        self.post_json(&path, &message).await?;
        debug!(node_id = %self.node_id, "heartbeat delivered");
        Ok(())
    }

    async fn request_jobs(&self, capacity: usize) -> Result<Vec<JobSpec>, TransportError> {
        let body = serde_json::to_value(JobRequest {
            node_id: &self.node_id,
            capacity,
            capabilities: &self.capabilities,
        })?;

        let response = self.post_json("/api/jobs/request", &body).await?;
        let assignments: JobsResponse = response.json().await?;
        if !assignments.jobs.is_empty() {
            info!(count = assignments.jobs.len(), "received job assignment(s)");
        }
        Ok(assignments.jobs)
    }

    async fn report_status(
        &self,
        job_id: &str,
        status: JobStatus,
        progress: u8,
    ) -> Result<(), TransportError> {
        let payload = self.status_payload(job_id, status, progress);
        let message = self.envelope("job_status_update", payload);
        let path = format!("/api/jobs/{job_id}/status");
        self.post_json(&path, &message).await?;
        Ok(())
    }

    async fn report_result(
        &self,
        job_id: &str,
        result: &JobResult,
    ) -> Result<(), TransportError> {
        let payload = self.result_payload(job_id, result);
        let message = self.envelope("job_result", payload);
        let path = format!("/api/jobs/{job_id}/result");
        self.post_json(&path, &message).await?;
        info!(%job_id, status = %result.status.as_str(), "job result delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ProcessingStats;

    fn test_client() -> HttpServerClient {
        HttpServerClient::new(
            "http://localhost:8080",
            "node-1",
            vec!["ocr".to_string()],
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_server_url() {
        let result = HttpServerClient::new(
            "not a url",
            "node-1",
            vec![],
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
    }

    #[test]
    fn test_base_url_trailing_slash_is_trimmed() {
        let client = HttpServerClient::new(
            "http://localhost:8080/",
            "node-1",
            vec![],
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.base_url, "http://localhost:8080");
    }

    #[test]
    fn test_envelope_shape() {
        let client = test_client();
        let message = client.envelope("node_heartbeat", json!({"node_id": "node-1"}));

        assert_eq!(message["message_type"], "node_heartbeat");
        assert_eq!(message["sender"]["id"], "node-1");
        assert_eq!(message["sender"]["type"], "node_agent");
        assert_eq!(message["payload"]["node_id"], "node-1");
        let message_id = message["message_id"].as_str().unwrap();
        assert!(Uuid::parse_str(message_id).is_ok());
        assert!(message["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_envelope_ids_are_unique() {
        let client = test_client();
        let first = client.envelope("node_heartbeat", json!({}));
        let second = client.envelope("node_heartbeat", json!({}));
        assert_ne!(first["message_id"], second["message_id"]);
    }

    #[test]
    fn test_status_payload_message() {
        let client = test_client();
        let payload = client.status_payload("job-9", JobStatus::Processing, 40);

        assert_eq!(payload["job_id"], "job-9");
        assert_eq!(payload["node_id"], "node-1");
        assert_eq!(payload["status"], "processing");
        assert_eq!(payload["progress"], 40);
        assert_eq!(payload["status_message"], "Job processing at 40.0%");
    }

    #[test]
    fn test_result_payload_truncates_long_text() {
        let client = test_client();
        let stats = ProcessingStats::between(Utc::now(), Utc::now());
        let long_text = "x".repeat(TEXT_PREVIEW_LIMIT + 50);
        let result = JobResult::completed(json!({"text_content": long_text}), stats);

        let payload = client.result_payload("job-9", &result);
        let shipped = payload["result"]["text_content"].as_str().unwrap();
        assert!(shipped.ends_with("... [truncated]"));
        assert!(shipped.chars().count() < TEXT_PREVIEW_LIMIT + 50);
        assert!(payload.get("error").is_none());
    }

    #[test]
    fn test_result_payload_keeps_short_text_and_error() {
        let client = test_client();
        let stats = ProcessingStats::between(Utc::now(), Utc::now());
        let result = JobResult::failed(
            "tool exited with status 1",
            json!({"job_id": "job-9"}),
            stats,
        );

        let payload = client.result_payload("job-9", &result);
        assert_eq!(payload["status"], "failed");
        assert_eq!(payload["result"], json!({}));
        assert_eq!(payload["error"]["message"], "tool exited with status 1");
        assert_eq!(payload["error"]["details"]["job_id"], "job-9");
    }
}
