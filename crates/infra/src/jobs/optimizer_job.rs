//! Optimizer job: compiles a registered program with a registered routine.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use optforge_ai::{Example, OptimizerError, OptimizerRegistry, Options, ProgramRegistry};
use optforge_core::JobId;

use super::envelope::{Job, JobEnvelope, JobError, ProgressReporter};
use super::store::ResultStore;
use super::types::{JobOutput, QueueConfig, QueuePriority, RetryPolicy};

/// Dispatch payload of an [`OptimizerJob`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeRequest {
    /// Registered routine name
    pub optimizer: String,
    /// Registered program name
    pub program: String,
    pub trainset: Vec<Example>,
    #[serde(default)]
    pub options: Options,
}

impl OptimizeRequest {
    pub fn new(
        optimizer: impl Into<String>,
        program: impl Into<String>,
        trainset: Vec<Example>,
    ) -> Self {
        Self {
            optimizer: optimizer.into(),
            program: program.into(),
            trainset,
            options: Options::new(),
        }
    }

    pub fn with_options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }
}

/// Binds the routine and program registries to the job envelope.
#[derive(Debug, Clone)]
pub struct OptimizerJob {
    optimizers: Arc<OptimizerRegistry>,
    programs: Arc<ProgramRegistry>,
}

impl OptimizerJob {
    pub const NAME: &'static str = "optimizer";

    pub fn new(optimizers: Arc<OptimizerRegistry>, programs: Arc<ProgramRegistry>) -> Self {
        Self {
            optimizers,
            programs,
        }
    }

    /// Scheduling policy: low-priority `optimization` queue, at most one re-attempt.
    pub fn queue_config() -> QueueConfig {
        QueueConfig::new("optimization")
            .with_priority(QueuePriority::Low)
            .with_retry(RetryPolicy::fixed(1, Duration::from_secs(30)))
    }

    /// Dispatch entry point.
    pub fn perform<S: ResultStore>(
        &self,
        envelope: &JobEnvelope<S>,
        job_id: &JobId,
        optimizer: &str,
        program: &str,
        trainset: Vec<Example>,
        options: Options,
    ) -> Result<JobOutput, JobError<OptimizerError>> {
        let request = OptimizeRequest::new(optimizer, program, trainset).with_options(options);
        envelope.perform(self, job_id, request)
    }
}

impl Job for OptimizerJob {
    type Payload = OptimizeRequest;
    type Error = OptimizerError;

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn validate(&self, request: &OptimizeRequest) -> Result<(), OptimizerError> {
        self.optimizers.check(&request.optimizer)?;
        self.programs.check(&request.program)?;
        Ok(())
    }

    fn run(
        &self,
        job_id: &JobId,
        request: OptimizeRequest,
        progress: &mut ProgressReporter<'_>,
    ) -> Result<JobOutput, OptimizerError> {
        let optimizer = self.optimizers.resolve(&request.optimizer, &request.options)?;
        let program = self.programs.resolve(&request.program, &request.options)?;

        debug!(
            job_id = %job_id,
            optimizer = optimizer.name(),
            program = program.name(),
            examples = request.trainset.len(),
            "compiling program"
        );

        let compiled =
            optimizer.compile(program, &request.trainset, &mut |p: u8| progress.report(p))?;

        Ok(JobOutput::new(compiled.program.to_config(), compiled.metrics))
    }
}
