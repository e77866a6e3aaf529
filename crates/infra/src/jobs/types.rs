//! Status/result records and per-job-type queue policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use optforge_ai::Metrics;
use optforge_core::Classified;

/// Lifecycle state of one job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted but not started. Never written by the envelope; readers see it when
    /// no status record exists yet.
    Queued,
    /// Job body is executing
    Running,
    /// Routine returned normally
    Completed,
    /// Routine failed (recorded, then re-signaled)
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status write as issued by the envelope.
///
/// The store stamps `updated_at` when it turns this into a [`StatusRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub status: JobState,
    pub progress: u8,
    pub message: String,
}

impl StatusUpdate {
    pub fn running(progress: u8, message: impl Into<String>) -> Self {
        Self {
            status: JobState::Running,
            progress: progress.min(100),
            message: message.into(),
        }
    }

    pub fn completed(message: impl Into<String>) -> Self {
        Self {
            status: JobState::Completed,
            progress: 100,
            message: message.into(),
        }
    }

    /// Failed status keeps the last progress reached during the attempt.
    pub fn failed(progress: u8, message: impl Into<String>) -> Self {
        Self {
            status: JobState::Failed,
            progress: progress.min(100),
            message: message.into(),
        }
    }

    pub fn stamp(&self, updated_at: DateTime<Utc>) -> StatusRecord {
        StatusRecord {
            status: self.status,
            progress: self.progress,
            message: self.message.clone(),
            updated_at,
        }
    }
}

/// Live progress descriptor, stored under `status:{job_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: JobState,
    /// Percentage in [0, 100]
    pub progress: u8,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

/// Terminal outcome, stored under `result:{job_id}` with a bounded lifetime.
///
/// Success records carry `payload` + `metrics`; failure records carry `error` +
/// `error_kind`. Absent fields are omitted from the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    pub completed_at: DateTime<Utc>,

    /// Lifetime the record was written with; the store expires it on its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl ResultRecord {
    pub fn success(payload: JsonValue, metrics: Metrics, completed_at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            metrics: Some(metrics),
            error: None,
            error_kind: None,
            completed_at,
            ttl_secs: None,
        }
    }

    pub fn failure(error: &impl Classified, completed_at: DateTime<Utc>) -> Self {
        Self::failure_with(error.kind(), error.to_string(), completed_at)
    }

    pub fn failure_with(
        kind: impl Into<String>,
        message: impl Into<String>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            success: false,
            payload: None,
            metrics: None,
            error: Some(message.into()),
            error_kind: Some(kind.into()),
            completed_at,
            ttl_secs: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = Some(ttl.as_secs());
        self
    }
}

/// What a job body hands back to the envelope on success.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    /// Externalizable artifact (persisted as the result payload)
    pub payload: JsonValue,
    pub metrics: Metrics,
}

impl JobOutput {
    pub fn new(payload: JsonValue, metrics: Metrics) -> Self {
        Self { payload, metrics }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Retry policy applied by the dispatcher after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Re-attempts allowed after the first attempt (0 = run once)
    pub max_retries: u32,
    /// Base delay between attempts
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Run once, never retry.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
        }
    }

    /// Delay before the attempt that follows failed attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
        };

        delay.min(self.max_delay)
    }

    /// Whether another attempt may follow failed attempt number `attempt` (1-indexed).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}

/// Scheduling priority of a job type relative to other queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    Low,
    #[default]
    Normal,
    High,
}

/// Per-job-type scheduling policy, handed to the dispatcher at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub queue: String,
    pub priority: QueuePriority,
    pub retry: RetryPolicy,
}

impl QueueConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            priority: QueuePriority::Normal,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
