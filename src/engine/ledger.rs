//! Job ledger
//!
//! Single-lock bookkeeping for every job the agent currently knows
//! about. A job id lives in exactly one of three sets (queued, active,
//! completed) from admission until its result is acknowledged, and is
//! never admitted twice while tracked. Completed entries stay in the
//! ledger until the server accepts their result, so reporting is
//! at-least-once.

use std::collections::VecDeque;

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::job::{JobRecord, JobResult, JobSpec, JobStatus};

/// A terminal job waiting for its result to be delivered.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    /// Final record of the job.
    pub record: JobRecord,
    /// Result payload to report.
    pub result: JobResult,
}

impl CompletedJob {
    /// The job's identifier.
    #[must_use]
    pub fn job_id(&self) -> &str {
        self.record.job_id()
    }
}

/// Counts of jobs per ledger set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerStats {
    /// Jobs admitted but not yet started.
    pub queued: usize,
    /// Jobs currently executing.
    pub active: usize,
    /// Jobs finished and awaiting acknowledgment.
    pub completed: usize,
}

#[derive(Default)]
struct LedgerInner {
    /// FIFO dispatch order for queued ids.
    order: VecDeque<String>,
    queued: AHashMap<String, JobRecord>,
    active: AHashMap<String, JobRecord>,
    completed: AHashMap<String, CompletedJob>,
}

impl LedgerInner {
    fn is_tracked(&self, job_id: &str) -> bool {
        self.queued.contains_key(job_id)
            || self.active.contains_key(job_id)
            || self.completed.contains_key(job_id)
    }
}

/// Shared job state behind one mutex.
///
/// All transitions are single-step map moves under the lock, so readers
/// never observe a job in two sets or in none.
pub struct JobLedger {
    limit: usize,
    inner: Mutex<LedgerInner>,
}

impl JobLedger {
    /// Creates a ledger that counts capacity against `limit` concurrent
    /// jobs.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// The concurrent job limit capacity is counted against.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Admits a job at the back of the queue.
    ///
    /// Returns false when the id is already tracked in any set; the
    /// duplicate delivery is dropped.
    pub fn admit(&self, spec: JobSpec) -> bool {
        let mut inner = self.inner.lock();
        if inner.is_tracked(&spec.job_id) {
            return false;
        }

        debug!(job_id = %spec.job_id, job_type = %spec.job_type, "job admitted");
        inner.order.push_back(spec.job_id.clone());
        let record = JobRecord::queued(spec);
        inner.queued.insert(record.job_id().to_string(), record);
        true
    }

    /// Takes the next job in FIFO order for dispatch.
    ///
    /// The record stays in the queued set until `mark_processing`; a
    /// refused dispatch puts the id back with `requeue_front`.
    pub fn pop_next(&self) -> Option<JobSpec> {
        let mut inner = self.inner.lock();
        let job_id = inner.order.pop_front()?;
        inner.queued.get(&job_id).map(|record| record.spec.clone())
    }

    /// Returns a popped id to the head of the queue.
    pub fn requeue_front(&self, job_id: &str) {
        let mut inner = self.inner.lock();
        if inner.queued.contains_key(job_id) {
            inner.order.push_front(job_id.to_string());
        }
    }

    /// Moves a queued job into the active set and stamps its start
    /// time. Returns false for unknown ids.
    pub fn mark_processing(&self, job_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(mut record) = inner.queued.remove(job_id) else {
            return false;
        };
        record.status = JobStatus::Processing;
        record.started_at = Some(chrono::Utc::now());
        inner.active.insert(job_id.to_string(), record);
        true
    }

    /// Updates progress of an active job, clamped to 100.
    pub fn update_progress(&self, job_id: &str, percent: u8) {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.active.get_mut(job_id) {
            record.progress = percent.min(100);
        }
    }

    /// Progress of an active job, when it is active.
    #[must_use]
    pub fn progress(&self, job_id: &str) -> Option<u8> {
        let inner = self.inner.lock();
        inner.active.get(job_id).map(|record| record.progress)
    }

    /// Moves an active job to completed with a success result. Progress
    /// is forced to 100. Returns false for unknown ids.
    pub fn complete(&self, job_id: &str, result: JobResult) -> bool {
        self.finish(job_id, result, None)
    }

    /// Moves an active job to completed with a failure result and the
    /// error message that caused it. Returns false for unknown ids.
    pub fn fail(&self, job_id: &str, message: &str, result: JobResult) -> bool {
        self.finish(job_id, result, Some(message.to_string()))
    }

    fn finish(&self, job_id: &str, result: JobResult, error: Option<String>) -> bool {
        let mut inner = self.inner.lock();
        let Some(mut record) = inner.active.remove(job_id) else {
            return false;
        };

        record.finished_at = Some(chrono::Utc::now());
        match error {
            None => {
                record.status = JobStatus::Completed;
                record.progress = 100;
            }
            Some(message) => {
                record.status = JobStatus::Failed;
                record.error = Some(message);
            }
        }

        inner
            .completed
            .insert(job_id.to_string(), CompletedJob { record, result });
        true
    }

    /// True while fewer than `limit` jobs are active.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.inner.lock().active.len() < self.limit
    }

    /// Free slots right now.
    #[must_use]
    pub fn available_capacity(&self) -> usize {
        self.limit.saturating_sub(self.inner.lock().active.len())
    }

    /// Number of executing jobs.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Snapshot of finished jobs awaiting acknowledgment. Entries are
    /// not removed; call `acknowledge` once the server has the result.
    #[must_use]
    pub fn completed_jobs(&self) -> Vec<CompletedJob> {
        self.inner.lock().completed.values().cloned().collect()
    }

    /// Drops a completed entry after its result was delivered. Returns
    /// false when the id was not awaiting acknowledgment.
    pub fn acknowledge(&self, job_id: &str) -> bool {
        self.inner.lock().completed.remove(job_id).is_some()
    }

    /// Current set sizes.
    #[must_use]
    pub fn stats(&self) -> LedgerStats {
        let inner = self.inner.lock();
        LedgerStats {
            queued: inner.queued.len(),
            active: inner.active.len(),
            completed: inner.completed.len(),
        }
    }
}

impl std::fmt::Debug for JobLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("JobLedger")
            .field("limit", &self.limit)
            .field("queued", &stats.queued)
            .field("active", &stats.active)
            .field("completed", &stats.completed)
            .finish()
    }
}
