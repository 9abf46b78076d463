//! Process wiring
//!
//! Builds the whole agent out of a loaded configuration, runs its three
//! loops (resource sampling, dispatch, orchestration) as tokio tasks,
//! and tears them down when a shutdown signal arrives.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{HttpServerClient, ServerTransport, TransportError};
use crate::engine::{Dispatcher, JobLedger, SlotPool};
use crate::infrastructure::config::AgentConfig;
use crate::job::CapabilityRegistry;
use crate::monitor::ResourceMonitor;

use super::schedule::ScheduleError;
use super::{AgentOptions, NodeAgent};

/// How long shutdown waits for loops before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Failures while assembling the process.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The configured schedule does not parse.
    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    /// The HTTP client could not be built.
    #[error("failed to build transport: {0}")]
    Transport(#[from] TransportError),

    /// The work directory could not be created.
    #[error("failed to prepare work directory {}: {source}", path.display())]
    WorkDir {
        /// Directory that failed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Signal handlers could not be installed.
    #[error("failed to install signal handlers: {0}")]
    Signals(#[from] std::io::Error),
}

/// A fully wired agent process.
pub struct AgentRuntime {
    agent: Arc<NodeAgent>,
    dispatcher: Arc<Dispatcher>,
    monitor: Arc<ResourceMonitor>,
    shutdown: CancellationToken,
}

impl AgentRuntime {
    /// Assembles the runtime with the built-in capabilities and an HTTP
    /// transport pointed at the configured server.
    ///
    /// # Errors
    ///
    /// Returns a `RuntimeError` when the work directory, schedule or
    /// transport cannot be set up.
    pub fn from_config(config: &AgentConfig) -> Result<Self, RuntimeError> {
        let registry = Arc::new(CapabilityRegistry::with_builtins());
        let node_id = resolve_node_id(config);
        let transport = Arc::new(HttpServerClient::new(
            &config.agent.connection.server_url,
            node_id.clone(),
            registry.supported(),
            Duration::from_secs(config.agent.connection.connect_timeout_seconds),
            Duration::from_secs(config.agent.connection.request_timeout_seconds),
        )?) as Arc<dyn ServerTransport>;

        Self::new(config, node_id, registry, transport)
    }

    /// Assembles the runtime around the given registry and transport.
    ///
    /// # Errors
    ///
    /// Returns a `RuntimeError` when the work directory or schedule
    /// cannot be set up.
    pub fn new(
        config: &AgentConfig,
        node_id: String,
        registry: Arc<CapabilityRegistry>,
        transport: Arc<dyn ServerTransport>,
    ) -> Result<Self, RuntimeError> {
        let work_dir = config.agent.processing.work_dir.clone();
        fs::create_dir_all(&work_dir).map_err(|source| RuntimeError::WorkDir {
            path: work_dir.clone(),
            source,
        })?;

        let schedule = config.schedule()?;
        let ledger = Arc::new(JobLedger::new(config.agent.resources.concurrent_jobs));
        let pool = Arc::new(SlotPool::new(
            Arc::clone(&ledger),
            Arc::clone(&registry),
            work_dir.clone(),
            config.agent.processing.cleanup_after_job,
        ));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&ledger), pool));
        let monitor = Arc::new(ResourceMonitor::with_system_sampler(
            config.monitor_settings(),
        ));

        let options = AgentOptions::new(node_id, registry.supported(), schedule, work_dir)
            .with_heartbeat_interval(Duration::from_secs(
                config.agent.connection.heartbeat_interval_seconds,
            ))
            .with_registration_backoff(Duration::from_secs(
                config.agent.connection.registration_backoff_seconds,
            ));

        let agent = Arc::new(NodeAgent::new(
            options,
            transport,
            ledger,
            Arc::clone(&dispatcher),
            Arc::clone(&monitor),
        ));

        Ok(Self {
            agent,
            dispatcher,
            monitor,
            shutdown: CancellationToken::new(),
        })
    }

    /// The token all loops watch; cancel it to stop the runtime.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Installs SIGTERM and SIGINT handlers that cancel the shutdown
    /// token.
    ///
    /// # Errors
    ///
    /// Returns a `RuntimeError` when the handlers cannot be installed.
    pub fn install_signal_handler(&self) -> Result<(), RuntimeError> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("received SIGINT, shutting down"),
            }
            token.cancel();
        });

        Ok(())
    }

    /// Runs all loops until the shutdown token fires, then joins them
    /// within a grace period, abandoning any that do not stop in time.
    pub async fn run(&self) {
        info!(version = crate::VERSION, "farmhand agent starting");

        let monitor_task = tokio::spawn({
            let monitor = Arc::clone(&self.monitor);
            let token = self.shutdown.clone();
            async move { monitor.run(token).await }
        });
        let dispatch_task = tokio::spawn({
            let dispatcher = Arc::clone(&self.dispatcher);
            let token = self.shutdown.clone();
            async move { dispatcher.run(token).await }
        });
        let agent_task = tokio::spawn({
            let agent = Arc::clone(&self.agent);
            let token = self.shutdown.clone();
            async move { agent.run(token).await }
        });

        self.shutdown.cancelled().await;
        info!("shutdown requested, draining loops");

        let drain = futures::future::join3(agent_task, dispatch_task, monitor_task);
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("some loops did not stop within the grace period, abandoning them");
        }

        info!("farmhand agent stopped");
    }
}

/// CLI override, then config, then the machine hostname.
fn resolve_node_id(config: &AgentConfig) -> String {
    config
        .agent
        .node_id
        .clone()
        .or_else(System::host_name)
        .unwrap_or_else(|| "farmhand-node".to_string())
}
