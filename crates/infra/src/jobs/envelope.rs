//! Job envelope: the begin → (progress)* → end protocol every job type follows.
//!
//! ```text
//! perform(job_id, payload)
//!   ↓
//! 1. status := running (0%)
//!   ↓
//! 2. job.run(..) with a bound ProgressReporter      → status := running (n%) per report
//!   ↓
//! 3a. Ok  → result := success, status := completed (100%)   → Ok(output)
//! 3b. Err → result := failure, status := failed             → Err(JobError::Failed)
//! 3c. panic → result := failure ("Panic"), status := failed → panic resumes
//! ```
//!
//! A routine failure is always recorded before it leaves the envelope. Store
//! failures are never reinterpreted as routine failures: they surface as
//! [`JobError::Store`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use optforge_core::{Classified, JobId};

use super::store::{DEFAULT_RESULT_TTL, ResultStore, ResultStoreError};
use super::types::{JobOutput, ResultRecord, StatusUpdate};

/// Classifier recorded when a job body panics.
pub const PANIC_KIND: &str = "Panic";

/// A concrete job type.
pub trait Job: Send + Sync {
    /// Input carried by the dispatcher (as JSON) for one execution.
    type Payload: DeserializeOwned + Send;

    /// Failure type of the job body.
    type Error: Classified + Send + 'static;

    /// Stable job type name (dispatcher routing key, status messages, logs).
    fn name(&self) -> &'static str;

    /// Cheap submission-time checks (e.g. references resolvable).
    fn validate(&self, _payload: &Self::Payload) -> Result<(), Self::Error> {
        Ok(())
    }

    /// The job body.
    fn run(
        &self,
        job_id: &JobId,
        payload: Self::Payload,
        progress: &mut ProgressReporter<'_>,
    ) -> Result<JobOutput, Self::Error>;
}

/// Outcome of an attempt that did not complete.
#[derive(Debug, thiserror::Error)]
pub enum JobError<E> {
    /// The job body failed. The failure has already been recorded.
    #[error("{0}")]
    Failed(E),

    /// The result store failed; the attempt could not be recorded.
    #[error("result store failure: {0}")]
    Store(#[from] ResultStoreError),
}

impl<E> JobError<E> {
    pub fn failure(&self) -> Option<&E> {
        match self {
            JobError::Failed(e) => Some(e),
            JobError::Store(_) => None,
        }
    }

    pub fn is_store(&self) -> bool {
        matches!(self, JobError::Store(_))
    }
}

/// Progress callback bound to one attempt.
///
/// Each report overwrites the status record with `running` and the reported
/// percentage. Values above 100 are clamped. A backwards value is written as
/// reported (monotonicity is the caller's convention) and logged.
///
/// After a failed write, further reports for this attempt are skipped and the
/// failure is handed back to the envelope.
pub struct ProgressReporter<'a> {
    store: &'a dyn ResultStore,
    job_id: &'a JobId,
    job_name: &'static str,
    last: u8,
    reports: u32,
    failure: Option<ResultStoreError>,
}

impl<'a> ProgressReporter<'a> {
    fn new(store: &'a dyn ResultStore, job_id: &'a JobId, job_name: &'static str) -> Self {
        Self {
            store,
            job_id,
            job_name,
            last: 0,
            reports: 0,
            failure: None,
        }
    }

    pub fn report(&mut self, progress: u8) {
        let message = format!("{}: {}% complete", self.job_name, progress.min(100));
        self.report_with(progress, message);
    }

    pub fn report_with(&mut self, progress: u8, message: impl Into<String>) {
        if self.failure.is_some() {
            return;
        }

        let progress = progress.min(100);
        if progress < self.last {
            warn!(
                job_id = %self.job_id,
                previous = self.last,
                progress,
                "progress moved backwards"
            );
        }

        match self
            .store
            .write_status(self.job_id, &StatusUpdate::running(progress, message))
        {
            Ok(()) => {
                self.last = progress;
                self.reports += 1;
                debug!(job_id = %self.job_id, progress, "progress updated");
            }
            Err(e) => {
                error!(
                    job_id = %self.job_id,
                    error = %e,
                    "progress write failed; skipping further updates for this attempt"
                );
                self.failure = Some(e);
            }
        }
    }

    /// Last successfully written progress value.
    pub fn last_progress(&self) -> u8 {
        self.last
    }

    /// Number of successful progress writes.
    pub fn reports(&self) -> u32 {
        self.reports
    }
}

/// Lifecycle wrapper around a [`ResultStore`].
#[derive(Debug)]
pub struct JobEnvelope<S> {
    store: S,
    result_ttl: Duration,
}

impl<S: ResultStore> JobEnvelope<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            result_ttl: DEFAULT_RESULT_TTL,
        }
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn result_ttl(&self) -> Duration {
        self.result_ttl
    }

    /// Run one attempt of `job` under `job_id`.
    pub fn perform<J: Job + ?Sized>(
        &self,
        job: &J,
        job_id: &JobId,
        payload: J::Payload,
    ) -> Result<JobOutput, JobError<J::Error>> {
        let name = job.name();
        info!(job_id = %job_id, job = name, "job started");

        self.store
            .write_status(job_id, &StatusUpdate::running(0, format!("{name}: starting")))?;

        let mut reporter = ProgressReporter::new(&self.store, job_id, name);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            job.run(job_id, payload, &mut reporter)
        }));
        let last_progress = reporter.last_progress();
        let lost_progress = reporter.failure.take();

        match outcome {
            Ok(Ok(output)) => {
                let record = ResultRecord::success(
                    output.payload.clone(),
                    output.metrics.clone(),
                    self.store.now(),
                )
                .with_ttl(self.result_ttl);
                let status = StatusUpdate::completed(format!("{name}: completed"));
                if let Err(e) = self.finish(job_id, &status, &record, lost_progress) {
                    error!(
                        job_id = %job_id,
                        job = name,
                        error = %e,
                        "job completed but the attempt could not be fully recorded"
                    );
                    return Err(JobError::Store(e));
                }

                info!(job_id = %job_id, job = name, "job completed");
                Ok(output)
            }
            Ok(Err(err)) => {
                let record =
                    ResultRecord::failure(&err, self.store.now()).with_ttl(self.result_ttl);
                let status = StatusUpdate::failed(last_progress, format!("failed: {err}"));
                if let Err(e) = self.finish(job_id, &status, &record, lost_progress) {
                    error!(
                        job_id = %job_id,
                        job = name,
                        kind = err.kind(),
                        job_error = %err,
                        error = %e,
                        "job failed and the attempt could not be fully recorded"
                    );
                    return Err(JobError::Store(e));
                }

                warn!(
                    job_id = %job_id,
                    job = name,
                    kind = err.kind(),
                    error = %err,
                    "job failed"
                );
                Err(JobError::Failed(err))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let record =
                    ResultRecord::failure_with(PANIC_KIND, message.clone(), self.store.now())
                        .with_ttl(self.result_ttl);
                let status = StatusUpdate::failed(last_progress, format!("failed: {message}"));

                // The panic is re-raised either way; a store error here can only be logged.
                if let Err(e) = self.finish(job_id, &status, &record, lost_progress) {
                    error!(job_id = %job_id, error = %e, "failed to record panic");
                }

                error!(job_id = %job_id, job = name, panic = %message, "job panicked");
                panic::resume_unwind(payload)
            }
        }
    }

    /// Terminal write. A progress write lost earlier in the attempt still fails
    /// the attempt, after the terminal state has been recorded.
    fn finish(
        &self,
        job_id: &JobId,
        status: &StatusUpdate,
        record: &ResultRecord,
        lost_progress: Option<ResultStoreError>,
    ) -> Result<(), ResultStoreError> {
        self.store
            .write_terminal(job_id, status, record, self.result_ttl)?;

        match lost_progress {
            Some(e) => {
                warn!(
                    job_id = %job_id,
                    recorded = %status.status,
                    error = %e,
                    "progress updates were lost; terminal state recorded"
                );
                Err(e)
            }
            None => Ok(()),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde_json::json;

    use optforge_ai::{Metrics, OptimizerError};

    use crate::jobs::store::InMemoryResultStore;
    use crate::jobs::types::{JobState, StatusRecord};

    /// Runs a scripted body: reports each progress value, then returns `outcome`.
    struct Scripted {
        steps: Vec<u8>,
        outcome: Result<JobOutput, OptimizerError>,
    }

    impl Job for Scripted {
        type Payload = ();
        type Error = OptimizerError;

        fn name(&self) -> &'static str {
            "scripted"
        }

        fn run(
            &self,
            _job_id: &JobId,
            _payload: (),
            progress: &mut ProgressReporter<'_>,
        ) -> Result<JobOutput, OptimizerError> {
            for step in &self.steps {
                progress.report(*step);
            }
            self.outcome.clone()
        }
    }

    struct Panicking;

    impl Job for Panicking {
        type Payload = ();
        type Error = OptimizerError;

        fn name(&self) -> &'static str {
            "panicking"
        }

        fn run(
            &self,
            _job_id: &JobId,
            _payload: (),
            progress: &mut ProgressReporter<'_>,
        ) -> Result<JobOutput, OptimizerError> {
            progress.report(30);
            panic!("index out of bounds");
        }
    }

    /// Store whose writes can be switched off.
    #[derive(Default)]
    struct Switchable {
        inner: InMemoryResultStore,
        down: AtomicBool,
    }

    impl Switchable {
        fn check(&self) -> Result<(), ResultStoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(ResultStoreError::Connection("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    impl ResultStore for Switchable {
        fn write_status(
            &self,
            job_id: &JobId,
            update: &StatusUpdate,
        ) -> Result<(), ResultStoreError> {
            self.check()?;
            self.inner.write_status(job_id, update)
        }

        fn write_result(
            &self,
            job_id: &JobId,
            record: &ResultRecord,
            ttl: Duration,
        ) -> Result<(), ResultStoreError> {
            self.check()?;
            self.inner.write_result(job_id, record, ttl)
        }

        fn read_status(&self, job_id: &JobId) -> Result<Option<StatusRecord>, ResultStoreError> {
            self.inner.read_status(job_id)
        }

        fn read_result(&self, job_id: &JobId) -> Result<Option<ResultRecord>, ResultStoreError> {
            self.inner.read_result(job_id)
        }
    }

    /// Goes down as soon as the first progress report (anything past 0%) arrives,
    /// and comes back before the terminal write.
    struct DownDuringProgress {
        inner: Switchable,
    }

    impl ResultStore for DownDuringProgress {
        fn write_status(
            &self,
            job_id: &JobId,
            update: &StatusUpdate,
        ) -> Result<(), ResultStoreError> {
            if update.status == JobState::Running && update.progress > 0 {
                self.inner.down.store(true, Ordering::SeqCst);
            } else if update.status.is_terminal() {
                self.inner.down.store(false, Ordering::SeqCst);
            }
            self.inner.write_status(job_id, update)
        }

        fn write_result(
            &self,
            job_id: &JobId,
            record: &ResultRecord,
            ttl: Duration,
        ) -> Result<(), ResultStoreError> {
            self.inner.down.store(false, Ordering::SeqCst);
            self.inner.write_result(job_id, record, ttl)
        }

        fn read_status(&self, job_id: &JobId) -> Result<Option<StatusRecord>, ResultStoreError> {
            self.inner.read_status(job_id)
        }

        fn read_result(&self, job_id: &JobId) -> Result<Option<ResultRecord>, ResultStoreError> {
            self.inner.read_result(job_id)
        }
    }

    fn job_id() -> JobId {
        JobId::new("env-1").unwrap()
    }

    fn output() -> JobOutput {
        let mut metrics = Metrics::new();
        metrics.insert("accuracy".into(), json!(1.0));
        JobOutput::new(json!({"rule": "identity"}), metrics)
    }

    #[test]
    fn success_records_result_then_completed_status() {
        let envelope = JobEnvelope::new(InMemoryResultStore::new());
        let job = Scripted {
            steps: vec![10, 45, 90],
            outcome: Ok(output()),
        };

        let out = envelope.perform(&job, &job_id(), ()).unwrap();
        assert_eq!(out, output());

        let status = envelope.store().read_status(&job_id()).unwrap().unwrap();
        assert_eq!(status.status, JobState::Completed);
        assert_eq!(status.progress, 100);

        let result = envelope.store().read_result(&job_id()).unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.payload, Some(out.payload));
        assert_eq!(result.metrics, Some(out.metrics));
    }

    #[test]
    fn failure_is_recorded_and_returned() {
        let envelope = JobEnvelope::new(InMemoryResultStore::new());
        let job = Scripted {
            steps: vec![20],
            outcome: Err(OptimizerError::Backend("model unavailable".into())),
        };

        let err = envelope.perform(&job, &job_id(), ()).unwrap_err();
        assert!(matches!(
            &err,
            JobError::Failed(OptimizerError::Backend(m)) if m == "model unavailable"
        ));

        let status = envelope.store().read_status(&job_id()).unwrap().unwrap();
        assert_eq!(status.status, JobState::Failed);
        assert_eq!(status.progress, 20);
        assert!(status.message.contains("model unavailable"));

        let result = envelope.store().read_result(&job_id()).unwrap().unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("model unavailable"));
        assert_eq!(result.error_kind.as_deref(), Some("BackendError"));
    }

    #[test]
    fn progress_values_above_100_are_clamped() {
        let store = InMemoryResultStore::new();
        let id = job_id();
        let mut reporter = ProgressReporter::new(&store, &id, "scripted");

        reporter.report(250);
        assert_eq!(reporter.last_progress(), 100);
        assert_eq!(reporter.reports(), 1);
        assert_eq!(store.read_status(&id).unwrap().unwrap().progress, 100);
    }

    #[test]
    fn initial_status_write_failure_is_a_store_error() {
        let store = Switchable::default();
        store.down.store(true, Ordering::SeqCst);
        let envelope = JobEnvelope::new(store);
        let job = Scripted {
            steps: vec![],
            outcome: Ok(output()),
        };

        let err = envelope.perform(&job, &job_id(), ()).unwrap_err();
        assert!(err.is_store());
        assert!(envelope.store().read_result(&job_id()).unwrap().is_none());
    }

    #[test]
    fn terminal_write_failure_is_not_masked_as_job_failure() {
        let store = Switchable::default();
        let envelope = JobEnvelope::new(store);

        struct OutageAtEnd<'a>(&'a AtomicBool);

        impl Job for OutageAtEnd<'_> {
            type Payload = ();
            type Error = OptimizerError;

            fn name(&self) -> &'static str {
                "outage"
            }

            fn run(
                &self,
                _job_id: &JobId,
                _payload: (),
                _progress: &mut ProgressReporter<'_>,
            ) -> Result<JobOutput, OptimizerError> {
                self.0.store(true, Ordering::SeqCst);
                Err(OptimizerError::Compilation("no candidate improved".into()))
            }
        }

        let err = envelope
            .perform(&OutageAtEnd(&envelope.store().down), &job_id(), ())
            .unwrap_err();

        // The store outage wins over the routine failure it could not record.
        assert!(err.is_store());
        assert!(err.failure().is_none());
    }

    #[test]
    fn lost_progress_fails_the_attempt_after_recording_terminal_state() {
        let envelope = JobEnvelope::new(DownDuringProgress {
            inner: Switchable::default(),
        });
        let job = Scripted {
            steps: vec![10, 45, 90],
            outcome: Ok(output()),
        };

        let err = envelope.perform(&job, &job_id(), ()).unwrap_err();
        assert!(err.is_store());

        let status = envelope.store().read_status(&job_id()).unwrap().unwrap();
        assert_eq!(status.status, JobState::Completed);
        assert!(envelope.store().read_result(&job_id()).unwrap().unwrap().success);
    }

    #[test]
    fn lost_progress_on_failed_routine_is_a_store_error() {
        let envelope = JobEnvelope::new(DownDuringProgress {
            inner: Switchable::default(),
        });
        let job = Scripted {
            steps: vec![20],
            outcome: Err(OptimizerError::Backend("model unavailable".into())),
        };

        let err = envelope.perform(&job, &job_id(), ()).unwrap_err();
        assert!(err.is_store());

        let result = envelope.store().read_result(&job_id()).unwrap().unwrap();
        assert_eq!(result.error_kind.as_deref(), Some("BackendError"));
        assert_eq!(
            envelope.store().read_status(&job_id()).unwrap().unwrap().status,
            JobState::Failed
        );
    }

    #[test]
    fn terminal_timestamps_share_the_store_clock() {
        use crate::jobs::store::ManualClock;

        let start = chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let envelope = JobEnvelope::new(InMemoryResultStore::with_clock(ManualClock::new(start)))
            .with_result_ttl(Duration::from_secs(90));
        let job = Scripted {
            steps: vec![],
            outcome: Ok(output()),
        };

        envelope.perform(&job, &job_id(), ()).unwrap();

        let result = envelope.store().read_result(&job_id()).unwrap().unwrap();
        let status = envelope.store().read_status(&job_id()).unwrap().unwrap();
        assert_eq!(result.completed_at, start);
        assert_eq!(status.updated_at, start);
        assert_eq!(result.ttl_secs, Some(90));
    }

    #[test]
    fn panic_is_recorded_then_resumed() {
        let store = Arc::new(InMemoryResultStore::new());
        let envelope = JobEnvelope::new(store.clone());

        let caught = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = envelope.perform(&Panicking, &job_id(), ());
        }));
        assert!(caught.is_err());

        let status = store.read_status(&job_id()).unwrap().unwrap();
        assert_eq!(status.status, JobState::Failed);
        assert_eq!(status.progress, 30);

        let result = store.read_result(&job_id()).unwrap().unwrap();
        assert_eq!(result.error_kind.as_deref(), Some(PANIC_KIND));
        assert_eq!(result.error.as_deref(), Some("index out of bounds"));
    }

    #[test]
    fn custom_result_ttl_is_applied() {
        use crate::jobs::store::ManualClock;

        let clock = ManualClock::default();
        let envelope = JobEnvelope::new(InMemoryResultStore::with_clock(clock.clone()))
            .with_result_ttl(Duration::from_secs(60));
        let job = Scripted {
            steps: vec![],
            outcome: Ok(output()),
        };

        envelope.perform(&job, &job_id(), ()).unwrap();
        clock.advance(Duration::from_secs(61));

        assert!(envelope.store().read_result(&job_id()).unwrap().is_none());
        // Status has no TTL.
        assert!(envelope.store().read_status(&job_id()).unwrap().is_some());
    }
}
