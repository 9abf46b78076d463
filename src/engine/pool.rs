//! Execution slot pool
//!
//! A fixed number of slots run job capabilities on blocking threads.
//! Admission order is the dispatcher's business; the pool is the
//! last-line capacity gate. Validation runs before a slot is taken, so
//! a spec that fails its pre-check resolves to a failed result without
//! consuming capacity. A job that outlives its timeout is marked failed
//! early and its execution is abandoned with a warning; the leaked
//! thread still cleans up its own workspace.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::engine::ledger::JobLedger;
use crate::job::{
    error_details, CapabilityRegistry, JobCapability, JobContext, JobResult, JobSpec,
    JobWorkspace, ProcessingStats, ProgressFn,
};

/// What `submit` did with a spec.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The job was taken by a slot, or resolved immediately as a
    /// validation failure.
    Accepted,
    /// Every slot is busy; the spec is handed back for requeueing.
    Saturated(JobSpec),
}

/// Bounded pool of job execution slots.
pub struct SlotPool {
    ledger: Arc<JobLedger>,
    registry: Arc<CapabilityRegistry>,
    slots: Arc<Semaphore>,
    work_dir: PathBuf,
    cleanup_after_job: bool,
}

impl SlotPool {
    /// Creates a pool with as many slots as the ledger's concurrency
    /// limit.
    #[must_use]
    pub fn new(
        ledger: Arc<JobLedger>,
        registry: Arc<CapabilityRegistry>,
        work_dir: PathBuf,
        cleanup_after_job: bool,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(ledger.limit()));
        Self {
            ledger,
            registry,
            slots,
            work_dir,
            cleanup_after_job,
        }
    }

    /// Free slots right now.
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Takes a job into a slot without blocking.
    ///
    /// Unknown job types and validation failures resolve to an
    /// immediate failed result and never occupy a slot.
    #[must_use]
    pub fn submit(&self, spec: JobSpec) -> SubmitOutcome {
        let Some(capability) = self.registry.get(&spec.job_type) else {
            let message = format!("unknown job type '{}'", spec.job_type);
            warn!(job_id = %spec.job_id, job_type = %spec.job_type, "rejecting job");
            self.resolve_failed(&spec, &message);
            return SubmitOutcome::Accepted;
        };

        if let Err(err) = capability.validate(&spec) {
            let message = err.to_string();
            warn!(job_id = %spec.job_id, error = %message, "job failed validation");
            self.resolve_failed(&spec, &message);
            return SubmitOutcome::Accepted;
        }

        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            return SubmitOutcome::Saturated(spec);
        };

        if !self.ledger.mark_processing(&spec.job_id) {
            error!(job_id = %spec.job_id, "job vanished from the queue before dispatch");
            return SubmitOutcome::Accepted;
        }

        debug!(job_id = %spec.job_id, job_type = %spec.job_type, "job taken by a slot");
        let ledger = Arc::clone(&self.ledger);
        let work_dir = self.work_dir.clone();
        let cleanup = self.cleanup_after_job;
        tokio::spawn(async move {
            run_slot(ledger, capability, spec, work_dir, cleanup).await;
            drop(permit);
        });

        SubmitOutcome::Accepted
    }

    /// Marks a job failed without execution, for pre-slot rejections.
    fn resolve_failed(&self, spec: &JobSpec, message: &str) {
        let now = Utc::now();
        let result = JobResult::failed(
            message,
            error_details(spec),
            ProcessingStats::between(now, now),
        );
        self.ledger.mark_processing(&spec.job_id);
        self.ledger.fail(&spec.job_id, message, result);
    }
}

/// Runs one job to completion inside its slot.
async fn run_slot(
    ledger: Arc<JobLedger>,
    capability: Arc<dyn JobCapability>,
    spec: JobSpec,
    work_dir: PathBuf,
    cleanup: bool,
) {
    let job_id = spec.job_id.clone();
    let started = Utc::now();

    let workspace = match JobWorkspace::create(&work_dir, &job_id) {
        Ok(workspace) => workspace,
        Err(err) => {
            let message = format!("failed to create workspace: {err}");
            error!(%job_id, error = %err, "workspace creation failed");
            let finished = Utc::now();
            let result = JobResult::failed(
                &message,
                error_details(&spec),
                ProcessingStats::between(started, finished),
            );
            ledger.fail(&job_id, &message, result);
            return;
        }
    };

    let progress_ledger = Arc::clone(&ledger);
    let progress_id = job_id.clone();
    let progress: ProgressFn =
        Arc::new(move |percent| progress_ledger.update_progress(&progress_id, percent));

    let ctx = JobContext::new(spec.clone(), workspace).with_progress(progress);
    let blocking_id = job_id.clone();
    let handle = tokio::task::spawn_blocking(move || {
        let outcome = capability.execute(&ctx);
        if cleanup {
            if let Err(err) = ctx.workspace().remove() {
                warn!(job_id = %blocking_id, error = %err, "workspace cleanup failed");
            }
        }
        outcome
    });

    let timeout = Duration::from_secs(spec.timeout_seconds);
    let outcome = tokio::time::timeout(timeout, handle).await;
    let finished = Utc::now();
    let stats = ProcessingStats::between(started, finished);

    match outcome {
        Ok(Ok(Ok(payload))) => {
            info!(%job_id, elapsed_seconds = stats.processing_time_seconds, "job completed");
            ledger.complete(&job_id, JobResult::completed(payload, stats));
        }
        Ok(Ok(Err(err))) => {
            let message = err.to_string();
            error!(%job_id, error = %message, "job failed");
            let result = JobResult::failed(&message, error_details(&spec), stats);
            ledger.fail(&job_id, &message, result);
        }
        Ok(Err(join_err)) => {
            let message = format!("job execution panicked: {join_err}");
            error!(%job_id, error = %join_err, "job execution panicked");
            let result = JobResult::failed(&message, error_details(&spec), stats);
            ledger.fail(&job_id, &message, result);
        }
        Err(_) => {
            let message = format!("job timed out after {}s", spec.timeout_seconds);
            warn!(
                %job_id,
                timeout_seconds = spec.timeout_seconds,
                "job timed out, abandoning execution"
            );
            let result = JobResult::failed(&message, error_details(&spec), stats);
            ledger.fail(&job_id, &message, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::CapabilityError;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct InstantCapability;

    impl JobCapability for InstantCapability {
        fn name(&self) -> &str {
            "instant"
        }

        fn validate(&self, _spec: &JobSpec) -> Result<(), CapabilityError> {
            Ok(())
        }

        fn execute(&self, ctx: &JobContext) -> Result<Value, CapabilityError> {
            ctx.report_progress(100);
            Ok(json!({"echo": ctx.spec().job_id}))
        }
    }

    struct PickyCapability;

    impl JobCapability for PickyCapability {
        fn name(&self) -> &str {
            "picky"
        }

        fn validate(&self, _spec: &JobSpec) -> Result<(), CapabilityError> {
            Err(CapabilityError::MissingParameter {
                name: "input_file".to_string(),
            })
        }

        fn execute(&self, _ctx: &JobContext) -> Result<Value, CapabilityError> {
            unreachable!("picky jobs never execute")
        }
    }

    struct SlowCapability {
        hold_ms: u64,
    }

    impl JobCapability for SlowCapability {
        fn name(&self) -> &str {
            "slow"
        }

        fn validate(&self, _spec: &JobSpec) -> Result<(), CapabilityError> {
            Ok(())
        }

        fn execute(&self, _ctx: &JobContext) -> Result<Value, CapabilityError> {
            std::thread::sleep(Duration::from_millis(self.hold_ms));
            Ok(json!({"slept_ms": self.hold_ms}))
        }
    }

    /// Blocks until released, to exercise timeouts without leaking a
    /// long-lived thread past the test.
    struct StallCapability {
        release: Arc<AtomicBool>,
    }

    impl JobCapability for StallCapability {
        fn name(&self) -> &str {
            "stall"
        }

        fn validate(&self, _spec: &JobSpec) -> Result<(), CapabilityError> {
            Ok(())
        }

        fn execute(&self, _ctx: &JobContext) -> Result<Value, CapabilityError> {
            while !self.release.load(Ordering::Relaxed) {
                std::thread::sleep(Duration::from_millis(20));
            }
            Ok(json!({"late": true}))
        }
    }

    struct TouchCapability;

    impl JobCapability for TouchCapability {
        fn name(&self) -> &str {
            "touch"
        }

        fn validate(&self, _spec: &JobSpec) -> Result<(), CapabilityError> {
            Ok(())
        }

        fn execute(&self, ctx: &JobContext) -> Result<Value, CapabilityError> {
            let marker = ctx.output_dir().join("marker.txt");
            std::fs::write(&marker, "done")?;
            Ok(json!({"marker": marker.display().to_string()}))
        }
    }

    fn pool_with(
        capability: Arc<dyn JobCapability>,
        limit: usize,
        work_dir: &TempDir,
        cleanup: bool,
    ) -> (Arc<JobLedger>, SlotPool) {
        let ledger = Arc::new(JobLedger::new(limit));
        let mut registry = CapabilityRegistry::new();
        registry.register(capability);
        let pool = SlotPool::new(
            Arc::clone(&ledger),
            Arc::new(registry),
            work_dir.path().to_path_buf(),
            cleanup,
        );
        (ledger, pool)
    }

    fn admit_and_pop(ledger: &JobLedger, spec: JobSpec) -> JobSpec {
        assert!(ledger.admit(spec));
        ledger.pop_next().unwrap()
    }

    async fn wait_until(deadline_ms: u64, condition: impl Fn() -> bool) {
        let mut waited = 0;
        while !condition() {
            assert!(waited < deadline_ms, "condition not met within {deadline_ms}ms");
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += 20;
        }
    }

    #[tokio::test]
    async fn test_submit_executes_and_completes() {
        let temp = TempDir::new().unwrap();
        let (ledger, pool) = pool_with(Arc::new(InstantCapability), 2, &temp, true);

        let spec = admit_and_pop(&ledger, JobSpec::new("j-1", "instant"));
        assert!(matches!(pool.submit(spec), SubmitOutcome::Accepted));

        wait_until(2000, || !ledger.completed_jobs().is_empty()).await;
        let done = ledger.completed_jobs().remove(0);
        assert!(done.result.is_success());
        assert_eq!(
            done.result.result.as_ref().unwrap()["echo"],
            json!("j-1"),
            "capability payload must round-trip into the ledger"
        );
        assert_eq!(done.record.progress, 100);
    }

    #[tokio::test]
    async fn test_validation_failure_skips_the_slot() {
        let temp = TempDir::new().unwrap();
        let (ledger, pool) = pool_with(Arc::new(PickyCapability), 2, &temp, true);

        let spec = admit_and_pop(&ledger, JobSpec::new("j-1", "picky"));
        assert!(matches!(pool.submit(spec), SubmitOutcome::Accepted));

        // Resolution is synchronous; no slot was consumed.
        assert_eq!(pool.available_slots(), 2);
        let done = ledger.completed_jobs().remove(0);
        assert!(!done.result.is_success());
        assert!(done
            .record
            .error
            .as_deref()
            .unwrap()
            .contains("input_file"));
    }

    #[tokio::test]
    async fn test_unknown_type_fails_immediately() {
        let temp = TempDir::new().unwrap();
        let (ledger, pool) = pool_with(Arc::new(InstantCapability), 2, &temp, true);

        let spec = admit_and_pop(&ledger, JobSpec::new("j-1", "transcode"));
        assert!(matches!(pool.submit(spec), SubmitOutcome::Accepted));

        let done = ledger.completed_jobs().remove(0);
        assert!(!done.result.is_success());
        let error = done.result.error.as_ref().unwrap();
        assert!(error.message.contains("unknown job type"));
        assert_eq!(error.details["job_id"], "j-1");
    }

    #[tokio::test]
    async fn test_saturated_pool_hands_the_spec_back() {
        let temp = TempDir::new().unwrap();
        let (ledger, pool) = pool_with(Arc::new(SlowCapability { hold_ms: 300 }), 1, &temp, true);

        let first = admit_and_pop(&ledger, JobSpec::new("j-1", "slow"));
        assert!(matches!(pool.submit(first), SubmitOutcome::Accepted));

        let second = admit_and_pop(&ledger, JobSpec::new("j-2", "slow"));
        match pool.submit(second) {
            SubmitOutcome::Saturated(returned) => assert_eq!(returned.job_id, "j-2"),
            SubmitOutcome::Accepted => panic!("second job must not fit a one-slot pool"),
        }

        wait_until(2000, || !ledger.completed_jobs().is_empty()).await;
    }

    #[tokio::test]
    async fn test_timeout_marks_failed_within_bound() {
        let temp = TempDir::new().unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let capability = StallCapability {
            release: Arc::clone(&release),
        };
        let (ledger, pool) = pool_with(Arc::new(capability), 1, &temp, true);

        let spec =
            admit_and_pop(&ledger, JobSpec::new("j-1", "stall").with_timeout_seconds(1));
        let begun = std::time::Instant::now();
        assert!(matches!(pool.submit(spec), SubmitOutcome::Accepted));

        wait_until(2000, || !ledger.completed_jobs().is_empty()).await;
        assert!(
            begun.elapsed() < Duration::from_secs(2),
            "timeout must resolve with bounded overhead"
        );

        let done = ledger.completed_jobs().remove(0);
        assert!(!done.result.is_success());
        assert!(done.record.error.as_deref().unwrap().contains("timed out"));

        // The slot must be free again even though the thread is abandoned.
        wait_until(2000, || pool.available_slots() == 1).await;
        release.store(true, Ordering::Relaxed);
    }

    #[tokio::test]
    async fn test_cleanup_removes_workspace() {
        let temp = TempDir::new().unwrap();
        let (ledger, pool) = pool_with(Arc::new(TouchCapability), 1, &temp, true);

        let spec = admit_and_pop(&ledger, JobSpec::new("j-1", "touch"));
        assert!(matches!(pool.submit(spec), SubmitOutcome::Accepted));

        wait_until(2000, || !ledger.completed_jobs().is_empty()).await;
        wait_until(2000, || !temp.path().join("j-1").exists()).await;
    }

    #[tokio::test]
    async fn test_cleanup_disabled_keeps_outputs() {
        let temp = TempDir::new().unwrap();
        let (ledger, pool) = pool_with(Arc::new(TouchCapability), 1, &temp, false);

        let spec = admit_and_pop(&ledger, JobSpec::new("j-1", "touch"));
        assert!(matches!(pool.submit(spec), SubmitOutcome::Accepted));

        wait_until(2000, || !ledger.completed_jobs().is_empty()).await;
        assert!(temp
            .path()
            .join("j-1")
            .join("output")
            .join("marker.txt")
            .exists());
    }
}
