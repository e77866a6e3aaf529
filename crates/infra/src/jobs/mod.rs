//! Asynchronous job execution with observable status and TTL-bounded results.
//!
//! ## Components
//!
//! - `ResultStore`: `status:{id}` / `result:{id}` persistence (in-memory or Redis)
//! - `JobEnvelope`: running → progress → completed/failed, record-then-re-signal
//! - `OptimizerJob`: resolves a routine and a program by name and compiles
//! - `JobDispatcher`: per-type queue, priority and retry policy
//!
//! A poller reads status and result independently; neither namespace is ever
//! written by anything but the envelope.

pub mod dispatcher;
pub mod envelope;
pub mod optimizer_job;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod types;

pub use dispatcher::{
    AttemptFailure, DispatchError, DispatchOutcome, DispatcherConfig, DispatcherStats,
    JobDispatcher, JobDispatcherHandle,
};
pub use envelope::{Job, JobEnvelope, JobError, PANIC_KIND, ProgressReporter};
pub use optimizer_job::{OptimizeRequest, OptimizerJob};
#[cfg(feature = "redis")]
pub use redis_store::RedisResultStore;
pub use store::{
    Clock, DEFAULT_RESULT_TTL, InMemoryResultStore, KeySpace, ManualClock, ResultStore,
    ResultStoreError, SystemClock,
};
pub use types::{
    BackoffStrategy, JobOutput, JobState, QueueConfig, QueuePriority, ResultRecord, RetryPolicy,
    StatusRecord, StatusUpdate,
};
