//! # Farmhand - A distributed document processing node agent
//!
//! Farmhand turns a spare machine into a worker node for a document
//! processing grid. It registers with a coordination server, reports
//! its load over heartbeats, pulls job assignments when it has spare
//! capacity, runs them through local tooling (`tesseract`, `pdftotext`)
//! and posts the results back.
//!
//! ## How a node behaves
//!
//! - **Admission control**: jobs are requested only when the node has a
//!   free slot, the rolling CPU/memory/disk readings are under their
//!   thresholds and the configured working hours allow it.
//! - **Bounded concurrency**: a fixed pool of job slots caps how many
//!   jobs run at once; everything else waits in a queue.
//! - **Fault isolation**: a failing job produces a structured error
//!   result, never a crashed agent. Transport failures are absorbed and
//!   retried on later cycles.
//!
//! ## Quick Start
//!
//! ```bash
//! # Start an agent against a local server with the default settings
//! farmhand run --server-url http://localhost:8080
//!
//! # Validate a config file and show the effective settings
//! farmhand check-config -c farmhand.yaml
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod agent;
pub mod api;
pub mod engine;
pub mod infrastructure;
pub mod job;
pub mod monitor;

// Re-export commonly used types
pub use agent::{AgentOptions, AgentRuntime, NodeAgent, RuntimeError, WorkSchedule};
pub use api::{HttpServerClient, ServerTransport, TransportError};
pub use engine::{Dispatcher, JobLedger, SlotPool};
pub use infrastructure::{AgentConfig, ConfigError, ConfigOverrides};
pub use job::{
    CapabilityError, CapabilityRegistry, JobCapability, JobError, JobResult, JobSpec, JobStatus,
};
pub use monitor::{LoadSample, MonitorSettings, ResourceMonitor};

/// Version of the farmhand crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
