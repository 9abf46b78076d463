//! Server transport
//!
//! The agent talks to the job server through the `ServerTransport`
//! trait; the production implementation is an HTTP client. Every
//! failure is transient from the core's point of view: callers log and
//! retry on their next cycle, nothing here escalates.

pub mod http;

pub use http::HttpServerClient;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::job::{JobResult, JobSpec, JobStatus};

/// Transport failures, all retriable.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection, timeout or protocol failure.
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered outside the 2xx range.
    #[error("server returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for the log line.
        body: String,
    },

    /// A payload refused to serialize.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// The configured server URL does not parse.
    #[error("invalid server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Node liveness advertised in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// No jobs executing.
    Idle,
    /// At least one job executing.
    Busy,
}

/// Hardware facts inside the registration payload.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceInfo {
    /// Logical CPU count.
    pub cpu_cores: usize,
    /// CPU brand string.
    pub cpu_model: String,
    /// Total physical memory, in MB.
    pub total_memory_mb: u64,
    /// Memory available right now, in MB.
    pub available_memory_mb: u64,
    /// Free space on the work directory's filesystem, in MB.
    pub available_disk_space_mb: u64,
    /// OS name and version.
    pub operating_system: String,
}

/// One window in which the node accepts work.
#[derive(Debug, Clone, Serialize)]
pub struct AvailableHours {
    /// Day name, or "All" for every day.
    pub day_of_week: String,
    /// Window start, "HH:MM".
    pub start_time: String,
    /// Window end, "HH:MM".
    pub end_time: String,
}

/// Scheduling windows advertised at registration.
#[derive(Debug, Clone, Serialize)]
pub struct TimeRestrictions {
    /// Windows in which the node accepts work.
    pub available_hours: Vec<AvailableHours>,
}

/// Everything the server learns about a node at registration.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationPayload {
    /// Node identifier.
    pub node_id: String,
    /// Machine hostname.
    pub hostname: String,
    /// Node address as seen from the node itself.
    pub ip_address: String,
    /// Agent version.
    pub version: String,
    /// Supported job types.
    pub capabilities: Vec<String>,
    /// Hardware facts.
    pub resource_info: ResourceInfo,
    /// Scheduling windows.
    pub time_restrictions: TimeRestrictions,
}

/// Load figures inside a heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct CurrentLoad {
    /// Latest CPU reading.
    pub cpu_percent: f64,
    /// Latest memory reading.
    pub memory_percent: f64,
    /// Memory available right now, in MB.
    pub available_memory_mb: u64,
    /// Jobs currently executing.
    pub active_jobs: usize,
}

/// Periodic liveness report.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatPayload {
    /// Node identifier.
    pub node_id: String,
    /// Idle or busy.
    pub status: NodeStatus,
    /// Load figures.
    pub current_load: CurrentLoad,
}

/// Client side of the job server protocol.
///
/// Implementations must tolerate transient failure; the agent treats
/// every error as "retry next cycle" and never crashes on one.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Announces this node to the server.
    ///
    /// # Errors
    ///
    /// Returns a `TransportError` when the server is unreachable or
    /// refuses the registration.
    async fn register_node(&self, registration: &RegistrationPayload)
        -> Result<(), TransportError>;

    /// Reports liveness and current load.
    ///
    /// # Errors
    ///
    /// Returns a `TransportError` when delivery fails.
    async fn send_heartbeat(&self, heartbeat: &HeartbeatPayload) -> Result<(), TransportError>;

    /// Asks for up to `capacity` job assignments.
    ///
    /// # Errors
    ///
    /// Returns a `TransportError` when the request fails; an empty
    /// vector is the "no work available" answer.
    async fn request_jobs(&self, capacity: usize) -> Result<Vec<JobSpec>, TransportError>;

    /// Reports a job lifecycle transition.
    ///
    /// # Errors
    ///
    /// Returns a `TransportError` when delivery fails.
    async fn report_status(
        &self,
        job_id: &str,
        status: JobStatus,
        progress: u8,
    ) -> Result<(), TransportError>;

    /// Delivers a job's final result.
    ///
    /// # Errors
    ///
    /// Returns a `TransportError` when delivery fails; the caller keeps
    /// the result for the next flush.
    async fn report_result(&self, job_id: &str, result: &JobResult)
        -> Result<(), TransportError>;
}
