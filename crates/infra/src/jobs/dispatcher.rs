//! In-process dispatcher: queue policy, priority and retry around the envelope.
//!
//! Each job type is registered with an explicit [`QueueConfig`]. Dispatches are
//! picked by priority (then FIFO), executed through the shared [`JobEnvelope`],
//! and re-enqueued under the same job id while the type's retry policy allows it.
//! Attempts for one id are sequential: a retry is only enqueued after the previous
//! attempt has returned.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use optforge_core::{Classified, JobId};

use super::envelope::{Job, JobEnvelope, JobError, PANIC_KIND, panic_message};
use super::store::ResultStore;
use super::types::{QueueConfig, QueuePriority};

/// Type-erased attempt runner.
type JobHandler = Box<dyn Fn(&JobId, JsonValue) -> Result<(), AttemptFailure> + Send + Sync>;

/// Type-erased submission check.
type PayloadCheck = Box<dyn Fn(&JsonValue) -> Result<(), DispatchError> + Send + Sync>;

/// Why an attempt did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    /// Classifier (`"BackendError"`, `"Panic"`, `"StoreError"`, ...)
    pub kind: String,
    pub message: String,
}

impl AttemptFailure {
    fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    fn from_job_error<E: Classified>(err: JobError<E>) -> Self {
        match err {
            JobError::Failed(e) => Self::new(e.kind(), e.to_string()),
            JobError::Store(e) => Self::new("StoreError", e.to_string()),
        }
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Dispatcher error (registration and submission).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("job type already registered: {0}")]
    DuplicateKind(String),
    #[error("no job type registered as: {0}")]
    UnknownKind(String),
    #[error("invalid payload for {kind}: {message}")]
    InvalidPayload { kind: String, message: String },
    /// Submission-time check rejected the payload (e.g. unknown routine reference).
    #[error("{kind} rejected ({error_kind}): {message}")]
    Rejected {
        kind: String,
        error_kind: String,
        message: String,
    },
}

/// What happened to one dispatched attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed { job_id: JobId, attempt: u32 },
    /// Failed; another attempt has been enqueued.
    Retrying {
        job_id: JobId,
        attempt: u32,
        failure: AttemptFailure,
    },
    /// Failed and the retry policy is exhausted.
    Exhausted {
        job_id: JobId,
        attempts: u32,
        failure: AttemptFailure,
    },
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub exhausted: u64,
}

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often to poll for ready work when idle
    pub poll_interval: Duration,
    /// Thread name and log field
    pub name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            name: "job-dispatcher".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

struct Registration {
    config: QueueConfig,
    handler: JobHandler,
    check: PayloadCheck,
}

#[derive(Debug, Clone)]
struct Pending {
    job_id: JobId,
    kind: String,
    payload: JsonValue,
    /// 1-indexed number of the attempt this dispatch will run
    attempt: u32,
    priority: QueuePriority,
    seq: u64,
    not_before: Option<Instant>,
}

impl Pending {
    fn is_ready(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|at| now >= at)
    }
}

/// Job dispatcher over a shared result store.
pub struct JobDispatcher<S: ResultStore> {
    envelope: Arc<JobEnvelope<S>>,
    registrations: HashMap<String, Registration>,
    queue: Mutex<Vec<Pending>>,
    next_seq: AtomicU64,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl<S: ResultStore + 'static> JobDispatcher<S> {
    pub fn new(envelope: JobEnvelope<S>) -> Self {
        Self {
            envelope: Arc::new(envelope),
            registrations: HashMap::new(),
            queue: Mutex::new(Vec::new()),
            next_seq: AtomicU64::new(0),
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        }
    }

    pub fn envelope(&self) -> &JobEnvelope<S> {
        &self.envelope
    }

    /// Register a job type under `job.name()` with its scheduling policy.
    pub fn register<J: Job + 'static>(
        &mut self,
        job: J,
        config: QueueConfig,
    ) -> Result<(), DispatchError> {
        let kind = job.name().to_string();
        if self.registrations.contains_key(&kind) {
            return Err(DispatchError::DuplicateKind(kind));
        }

        let job = Arc::new(job);

        let runner = Arc::clone(&job);
        let envelope = Arc::clone(&self.envelope);
        let handler: JobHandler = Box::new(move |job_id, payload| {
            let payload: J::Payload = serde_json::from_value(payload)
                .map_err(|e| AttemptFailure::new("InvalidPayload", e.to_string()))?;
            envelope
                .perform(runner.as_ref(), job_id, payload)
                .map(|_| ())
                .map_err(AttemptFailure::from_job_error)
        });

        let checker = Arc::clone(&job);
        let check_kind = kind.clone();
        let check: PayloadCheck = Box::new(move |payload| {
            let payload: J::Payload =
                serde_json::from_value(payload.clone()).map_err(|e| DispatchError::InvalidPayload {
                    kind: check_kind.clone(),
                    message: e.to_string(),
                })?;
            checker.validate(&payload).map_err(|e| DispatchError::Rejected {
                kind: check_kind.clone(),
                error_kind: e.kind().to_string(),
                message: e.to_string(),
            })
        });

        info!(
            kind = %kind,
            queue = %config.queue,
            priority = ?config.priority,
            max_retries = config.retry.max_retries,
            "registered job type"
        );
        self.registrations.insert(
            kind,
            Registration {
                config,
                handler,
                check,
            },
        );
        Ok(())
    }

    pub fn queue_config(&self, kind: &str) -> Option<&QueueConfig> {
        self.registrations.get(kind).map(|r| &r.config)
    }

    /// Submit a new job. The payload is checked before it is queued.
    pub fn enqueue(
        &self,
        kind: &str,
        job_id: JobId,
        payload: JsonValue,
    ) -> Result<(), DispatchError> {
        let registration = self
            .registrations
            .get(kind)
            .ok_or_else(|| DispatchError::UnknownKind(kind.to_string()))?;
        (registration.check)(&payload)?;

        debug!(job_id = %job_id, kind, queue = %registration.config.queue, "job enqueued");
        self.push(Pending {
            job_id,
            kind: kind.to_string(),
            payload,
            attempt: 1,
            priority: registration.config.priority,
            seq: 0,
            not_before: None,
        });
        Ok(())
    }

    /// Number of queued dispatches (ready or delayed).
    pub fn pending(&self) -> usize {
        self.lock_queue().len()
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Execute the highest-priority ready dispatch, if any.
    pub fn run_next(&self) -> Option<DispatchOutcome> {
        let pending = self.pop_ready(Instant::now())?;
        let Some(registration) = self.registrations.get(&pending.kind) else {
            // Unreachable through `enqueue`; drop rather than spin on it.
            error!(job_id = %pending.job_id, kind = %pending.kind, "no handler for queued job");
            return None;
        };

        debug!(
            job_id = %pending.job_id,
            kind = %pending.kind,
            attempt = pending.attempt,
            "dispatching job"
        );

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            (registration.handler)(&pending.job_id, pending.payload.clone())
        }))
        .unwrap_or_else(|payload| {
            Err(AttemptFailure::new(PANIC_KIND, panic_message(payload.as_ref())))
        });

        let outcome = match result {
            Ok(()) => DispatchOutcome::Completed {
                job_id: pending.job_id.clone(),
                attempt: pending.attempt,
            },
            Err(failure) => self.after_failure(&registration.config, pending, failure),
        };

        self.record(&outcome);
        Some(outcome)
    }

    /// Run ready dispatches until none is left; delayed retries stay queued.
    pub fn drain(&self) -> Vec<DispatchOutcome> {
        std::iter::from_fn(|| self.run_next()).collect()
    }

    /// Spawn the worker loop in a background thread.
    pub fn spawn(self, config: DispatcherConfig) -> std::io::Result<JobDispatcherHandle<S>> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let dispatcher = Arc::new(self);
        let worker = Arc::clone(&dispatcher);

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || dispatcher_loop(&worker, &config, &shutdown_rx))?;

        Ok(JobDispatcherHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            dispatcher,
        })
    }

    fn after_failure(
        &self,
        config: &QueueConfig,
        pending: Pending,
        failure: AttemptFailure,
    ) -> DispatchOutcome {
        if config.retry.should_retry(pending.attempt) {
            let delay = config.retry.delay_for_attempt(pending.attempt);
            warn!(
                job_id = %pending.job_id,
                attempt = pending.attempt,
                error = %failure,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "job attempt failed; retrying"
            );

            let outcome = DispatchOutcome::Retrying {
                job_id: pending.job_id.clone(),
                attempt: pending.attempt,
                failure,
            };
            self.push(Pending {
                attempt: pending.attempt + 1,
                not_before: (!delay.is_zero()).then(|| Instant::now() + delay),
                ..pending
            });
            outcome
        } else {
            warn!(
                job_id = %pending.job_id,
                attempts = pending.attempt,
                error = %failure,
                "job failed; retries exhausted"
            );
            DispatchOutcome::Exhausted {
                job_id: pending.job_id,
                attempts: pending.attempt,
                failure,
            }
        }
    }

    fn record(&self, outcome: &DispatchOutcome) {
        let mut s = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        s.processed += 1;
        match outcome {
            DispatchOutcome::Completed { .. } => s.succeeded += 1,
            DispatchOutcome::Retrying { .. } => {
                s.failed += 1;
                s.retried += 1;
            }
            DispatchOutcome::Exhausted { .. } => {
                s.failed += 1;
                s.exhausted += 1;
            }
        }
    }

    fn push(&self, mut pending: Pending) {
        pending.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.lock_queue().push(pending);
    }

    fn pop_ready(&self, now: Instant) -> Option<Pending> {
        let mut queue = self.lock_queue();
        let index = queue
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_ready(now))
            .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|(i, _)| i)?;
        Some(queue.swap_remove(index))
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, Vec<Pending>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to control a running dispatcher.
pub struct JobDispatcherHandle<S: ResultStore> {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    dispatcher: Arc<JobDispatcher<S>>,
}

impl<S: ResultStore + 'static> JobDispatcherHandle<S> {
    /// Submit work to the running dispatcher.
    pub fn enqueue(
        &self,
        kind: &str,
        job_id: JobId,
        payload: JsonValue,
    ) -> Result<(), DispatchError> {
        self.dispatcher.enqueue(kind, job_id, payload)
    }

    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    pub fn pending(&self) -> usize {
        self.dispatcher.pending()
    }

    pub fn envelope(&self) -> &JobEnvelope<S> {
        self.dispatcher.envelope()
    }

    /// Request graceful shutdown; the attempt in flight finishes first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

fn dispatcher_loop<S: ResultStore + 'static>(
    dispatcher: &JobDispatcher<S>,
    config: &DispatcherConfig,
    shutdown_rx: &mpsc::Receiver<()>,
) {
    info!(dispatcher = %config.name, "job dispatcher started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        if dispatcher.run_next().is_none() {
            match shutdown_rx.recv_timeout(config.poll_interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }
    }

    info!(dispatcher = %config.name, "job dispatcher stopped");
}
