//! Job identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of one job execution instance.
///
/// Opaque to the job layer: callers may supply their own (e.g. a request id) or
/// let [`JobId::generate`] mint one.
///
/// Contract: any non-empty string without whitespace. Separators such as `:` or
/// `/` are accepted as-is; whitespace is rejected so an id stays one token in
/// store keys, log fields and `redis-cli` sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Parse a caller-supplied identifier.
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DomainError::invalid_id("JobId: must not be empty"));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(DomainError::invalid_id(format!(
                "JobId: must not contain whitespace ({value:?})"
            )));
        }
        Ok(Self(value))
    }

    /// Mint a fresh identifier.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
    /// for determinism.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_whitespace() {
        assert!(matches!(JobId::new(""), Err(DomainError::InvalidId(_))));
        assert!(matches!(JobId::new("job 1"), Err(DomainError::InvalidId(_))));
        assert!(matches!(JobId::new("job\n1"), Err(DomainError::InvalidId(_))));
    }

    #[test]
    fn accepts_any_other_characters() {
        for raw in ["opt-42", "tenant:run/7", "ü-λ", "a"] {
            assert_eq!(JobId::new(raw).unwrap().as_str(), raw);
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert!(JobId::new(a.to_string()).is_ok());
    }

    #[test]
    fn serializes_as_plain_string() {
        let id: JobId = "opt-42".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"opt-42\"");

        let back: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<JobId>("\"\"").is_err());
    }
}
