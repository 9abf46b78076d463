//! Agent orchestration
//!
//! The `NodeAgent` owns the server-facing side of the node: it
//! registers, heartbeats on an interval, pulls job assignments when the
//! node has room for them, and reports finished results. Every
//! transport failure is absorbed and retried on a later cycle; only the
//! shutdown token stops the loop.

pub mod runtime;
pub mod schedule;

pub use runtime::{AgentRuntime, RuntimeError};
pub use schedule::{ScheduleError, WorkSchedule};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{
    CurrentLoad, HeartbeatPayload, NodeStatus, RegistrationPayload, ResourceInfo,
    ServerTransport, TimeRestrictions,
};
use crate::engine::{Dispatcher, JobLedger};
use crate::job::JobStatus;
use crate::monitor::{free_disk_mb_at, HostInfo, ResourceMonitor};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_REGISTRATION_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Identity and cadence settings for the orchestration loop.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Identifier this node registers under.
    pub node_id: String,
    /// Job types advertised to the server.
    pub capabilities: Vec<String>,
    /// When the node accepts new work.
    pub schedule: WorkSchedule,
    /// Directory whose filesystem backs job workspaces.
    pub work_dir: PathBuf,
    /// Time between heartbeats.
    pub heartbeat_interval: Duration,
    /// Pause after a failed registration attempt.
    pub registration_backoff: Duration,
    /// Pause between healthy iterations.
    pub poll_interval: Duration,
    /// Pause after an iteration that hit a transport error.
    pub error_backoff: Duration,
}

impl AgentOptions {
    /// Options with default cadences.
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        capabilities: Vec<String>,
        schedule: WorkSchedule,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            capabilities,
            schedule,
            work_dir,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            registration_backoff: DEFAULT_REGISTRATION_BACKOFF,
            poll_interval: DEFAULT_POLL_INTERVAL,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }

    /// Overrides the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Overrides the registration retry pause.
    #[must_use]
    pub fn with_registration_backoff(mut self, backoff: Duration) -> Self {
        self.registration_backoff = backoff;
        self
    }

    /// Overrides the iteration pause.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the post-error pause.
    #[must_use]
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// The server-facing orchestration loop.
pub struct NodeAgent {
    options: AgentOptions,
    transport: Arc<dyn ServerTransport>,
    ledger: Arc<JobLedger>,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<ResourceMonitor>,
}

impl NodeAgent {
    /// Wires the loop to its collaborators.
    #[must_use]
    pub fn new(
        options: AgentOptions,
        transport: Arc<dyn ServerTransport>,
        ledger: Arc<JobLedger>,
        dispatcher: Arc<Dispatcher>,
        monitor: Arc<ResourceMonitor>,
    ) -> Self {
        Self {
            options,
            transport,
            ledger,
            dispatcher,
            monitor,
        }
    }

    /// Runs until `shutdown` fires.
    ///
    /// Starts unregistered and retries registration on a backoff; once
    /// registered it stays registered. Each iteration heartbeats when
    /// the interval elapsed, requests work when the node has room, and
    /// flushes finished results. An iteration that hit a transport
    /// error pauses for the error backoff instead of the poll interval.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(node_id = %self.options.node_id, "node agent started");
        let mut registered = false;
        let mut last_heartbeat: Option<Instant> = None;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if !registered {
                if self.register().await {
                    registered = true;
                } else {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.options.registration_backoff) => {}
                    }
                    continue;
                }
            }

            let mut healthy = true;

            let heartbeat_due = last_heartbeat
                .map_or(true, |sent| sent.elapsed() >= self.options.heartbeat_interval);
            if heartbeat_due {
                healthy &= self.send_heartbeat().await;
                last_heartbeat = Some(Instant::now());
            }

            healthy &= self.request_jobs().await;
            healthy &= self.flush_results().await;

            let pause = if healthy {
                self.options.poll_interval
            } else {
                self.options.error_backoff
            };
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }

        info!("node agent stopped");
    }

    /// One registration attempt.
    async fn register(&self) -> bool {
        let registration = self.registration_payload();
        match self.transport.register_node(&registration).await {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "registration failed, retrying shortly");
                false
            }
        }
    }

    /// Reports liveness, load and busy/idle state.
    async fn send_heartbeat(&self) -> bool {
        let load = self.monitor.current_load();
        let active_jobs = self.ledger.active_count();
        let status = if active_jobs > 0 {
            NodeStatus::Busy
        } else {
            NodeStatus::Idle
        };

        let heartbeat = HeartbeatPayload {
            node_id: self.options.node_id.clone(),
            status,
            current_load: CurrentLoad {
                cpu_percent: load.cpu_percent,
                memory_percent: load.memory_percent,
                available_memory_mb: load.available_memory_mb,
                active_jobs,
            },
        };

        match self.transport.send_heartbeat(&heartbeat).await {
            Ok(()) => true,
            Err(error) => {
                warn!(%error, "heartbeat delivery failed");
                false
            }
        }
    }

    /// Pulls assignments when capacity, resources and schedule allow.
    async fn request_jobs(&self) -> bool {
        if !self.ledger.has_capacity() {
            debug!("no free capacity, skipping job request");
            return true;
        }
        if !self.monitor.can_accept_jobs() {
            debug!("resource constraints prevent accepting new jobs");
            return true;
        }
        if !self.options.schedule.is_open_now() {
            debug!("outside scheduled processing hours, not requesting jobs");
            return true;
        }

        let capacity = self.ledger.available_capacity();
        let jobs = match self.transport.request_jobs(capacity).await {
            Ok(jobs) => jobs,
            Err(error) => {
                warn!(%error, "job request failed");
                return false;
            }
        };

        for spec in jobs {
            info!(job_id = %spec.job_id, job_type = %spec.job_type, "received job assignment");
            let job_id = spec.job_id.clone();
            if self.dispatcher.enqueue(spec) {
                // Best effort; the result channel is authoritative.
                if let Err(error) = self
                    .transport
                    .report_status(&job_id, JobStatus::Queued, 0)
                    .await
                {
                    debug!(%job_id, %error, "queued status update failed");
                }
            }
        }
        true
    }

    /// Reports finished jobs, acknowledging each confirmed delivery.
    async fn flush_results(&self) -> bool {
        let mut delivered_all = true;

        for finished in self.ledger.completed_jobs() {
            let job_id = finished.job_id().to_string();
            match self.transport.report_result(&job_id, &finished.result).await {
                Ok(()) => {
                    info!(%job_id, "job result reported");
                    self.ledger.acknowledge(&job_id);
                }
                Err(error) => {
                    warn!(%job_id, %error, "failed to report job result, will retry later");
                    delivered_all = false;
                }
            }
        }

        delivered_all
    }

    /// Builds the registration payload from fresh host facts.
    fn registration_payload(&self) -> RegistrationPayload {
        let host = HostInfo::collect();
        let available_disk_space_mb = free_disk_mb_at(&self.options.work_dir).unwrap_or(0);

        RegistrationPayload {
            node_id: self.options.node_id.clone(),
            hostname: host.hostname,
            ip_address: host.ip_address,
            version: crate::VERSION.to_string(),
            capabilities: self.options.capabilities.clone(),
            resource_info: ResourceInfo {
                cpu_cores: host.cpu_cores,
                cpu_model: host.cpu_model,
                total_memory_mb: host.total_memory_mb,
                available_memory_mb: host.available_memory_mb,
                available_disk_space_mb,
                operating_system: host.operating_system,
            },
            time_restrictions: TimeRestrictions {
                available_hours: self.options.schedule.available_hours(),
            },
        }
    }
}
