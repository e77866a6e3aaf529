use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::result::{Compilation, OptimizerError};

/// Routine configuration, passed to factories when a routine or program is constructed.
pub type Options = serde_json::Map<String, JsonValue>;

/// One training record.
///
/// Opaque to the job layer; only the routine interprets its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Example(pub JsonValue);

impl Example {
    pub fn new(value: JsonValue) -> Self {
        Self(value)
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }
}

impl From<JsonValue> for Example {
    fn from(value: JsonValue) -> Self {
        Self(value)
    }
}

/// A trainable program.
pub trait Program {
    /// Registered name of the program type.
    fn name(&self) -> &str;

    /// Externalizable configuration (what gets persisted as the result payload).
    fn to_config(&self) -> JsonValue;
}

/// An optimization routine.
pub trait Optimizer {
    /// Registered name of the routine.
    fn name(&self) -> &str;

    /// Compile `program` against `trainset`.
    ///
    /// `progress` takes a completion percentage. It may be called any number of
    /// times (including zero), always on the calling thread, and has no influence
    /// on the computation.
    fn compile(
        &self,
        program: Box<dyn Program>,
        trainset: &[Example],
        progress: &mut dyn FnMut(u8),
    ) -> Result<Compilation, OptimizerError>;
}
