use serde_json::Value as JsonValue;
use thiserror::Error;

use optforge_core::Classified;

use crate::optimizer::Program;

/// Final metrics reported by a routine (e.g. `{"accuracy": 0.92}`).
pub type Metrics = serde_json::Map<String, JsonValue>;

/// Output of a successful compilation.
pub struct Compilation {
    /// The compiled program.
    pub program: Box<dyn Program>,

    /// The routine's own final metrics.
    pub metrics: Metrics,
}

impl Compilation {
    pub fn new(program: Box<dyn Program>) -> Self {
        Self {
            program,
            metrics: Metrics::new(),
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metrics.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Debug for Compilation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compilation")
            .field("program", &self.program.name())
            .field("metrics", &self.metrics)
            .finish()
    }
}

/// Failure raised by an optimization routine (or while constructing one).
///
/// `Display` is the bare message; the category is exposed through [`Classified::kind`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptimizerError {
    /// Trainset or options rejected by the routine.
    #[error("{0}")]
    InvalidInput(String),

    /// Unresolvable routine/program reference or malformed configuration.
    #[error("{0}")]
    Configuration(String),

    /// The completion backend failed (unavailable, rate limited, ...).
    #[error("{0}")]
    Backend(String),

    /// The routine ran but could not produce a compiled program.
    #[error("{0}")]
    Compilation(String),

    #[error("{0}")]
    Internal(String),

    /// Routine-defined category.
    #[error("{message}")]
    Other { kind: String, message: String },
}

impl OptimizerError {
    pub fn classified(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Other {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl Classified for OptimizerError {
    fn kind(&self) -> &str {
        match self {
            OptimizerError::InvalidInput(_) => "ValidationError",
            OptimizerError::Configuration(_) => "ConfigurationError",
            OptimizerError::Backend(_) => "BackendError",
            OptimizerError::Compilation(_) => "CompilationError",
            OptimizerError::Internal(_) => "InternalError",
            OptimizerError::Other { kind, .. } => kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_verbatim() {
        let err = OptimizerError::Backend("model unavailable".to_string());
        assert_eq!(err.to_string(), "model unavailable");
        assert_eq!(err.kind(), "BackendError");
    }

    #[test]
    fn custom_classifier_is_preserved() {
        let err = OptimizerError::classified("RateLimited", "429 from provider");
        assert_eq!(err.kind(), "RateLimited");
        assert_eq!(err.to_string(), "429 from provider");
    }
}
