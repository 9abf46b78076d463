//! Dispatch loop
//!
//! One background task moves admitted jobs from the queue into slots.
//! Dispatch is strictly FIFO and gated on ledger capacity; the `priority`
//! field on specs is carried but does not affect ordering. When the pool
//! or the capacity check refuses, the loop backs off for one poll
//! interval without reordering anything.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::ledger::JobLedger;
use crate::engine::pool::{SlotPool, SubmitOutcome};
use crate::job::JobSpec;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// FIFO job dispatcher over the slot pool.
pub struct Dispatcher {
    ledger: Arc<JobLedger>,
    pool: Arc<SlotPool>,
    poll_interval: Duration,
}

impl Dispatcher {
    /// Creates a dispatcher polling at the default one second cadence.
    #[must_use]
    pub fn new(ledger: Arc<JobLedger>, pool: Arc<SlotPool>) -> Self {
        Self {
            ledger,
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Overrides the poll cadence.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Admits a server-assigned job at the back of the queue.
    ///
    /// Returns false for duplicate ids, which are dropped without
    /// surfacing an error to the server.
    pub fn enqueue(&self, spec: JobSpec) -> bool {
        let job_id = spec.job_id.clone();
        let job_type = spec.job_type.clone();
        if self.ledger.admit(spec) {
            info!(%job_id, %job_type, "job queued");
            true
        } else {
            warn!(%job_id, "job already known, skipping duplicate assignment");
            false
        }
    }

    /// Moves as many queued jobs into slots as capacity allows.
    pub fn dispatch_ready(&self) {
        while self.ledger.has_capacity() {
            let Some(spec) = self.ledger.pop_next() else {
                break;
            };
            match self.pool.submit(spec) {
                SubmitOutcome::Accepted => {}
                SubmitOutcome::Saturated(spec) => {
                    debug!(job_id = %spec.job_id, "all slots busy, requeueing at the head");
                    self.ledger.requeue_front(&spec.job_id);
                    break;
                }
            }
        }
    }

    /// Runs the dispatch loop until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("dispatcher started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = sleep(self.poll_interval) => self.dispatch_ready(),
            }
        }
        info!("dispatcher stopped");
    }
}
