//! Late binding of routines and programs by name.
//!
//! Names are validated when a factory is registered, so a typo in wiring fails at
//! startup instead of deep inside a running job.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::optimizer::{Optimizer, Options, Program};
use crate::result::OptimizerError;

/// Factory building a fresh instance from routine options.
pub type Factory<T> = Box<dyn Fn(&Options) -> Result<Box<T>, OptimizerError> + Send + Sync>;

pub type OptimizerRegistry = Registry<dyn Optimizer>;
pub type ProgramRegistry = Registry<dyn Program>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{kind} name must be non-empty and free of whitespace: {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("{kind} already registered: {name}")]
    Duplicate { kind: &'static str, name: String },

    #[error("unknown {kind}: {name}")]
    Unknown { kind: &'static str, name: String },

    /// The factory itself rejected the options.
    #[error("failed to construct {kind} {name}: {source}")]
    Construction {
        kind: &'static str,
        name: String,
        #[source]
        source: OptimizerError,
    },
}

impl From<RegistryError> for OptimizerError {
    fn from(err: RegistryError) -> Self {
        match err {
            // Keep the factory's own classification (e.g. malformed options).
            RegistryError::Construction { source, .. } => source,
            other => OptimizerError::Configuration(other.to_string()),
        }
    }
}

/// Name → factory map.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    factories: BTreeMap<String, Factory<T>>,
}

impl<T: ?Sized> Registry<T> {
    /// `kind` names what is registered ("optimizer", "program") in error messages.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: BTreeMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&Options) -> Result<Box<T>, OptimizerError> + Send + Sync + 'static,
    {
        let name = name.into();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(RegistryError::InvalidName {
                kind: self.kind,
                name,
            });
        }
        if self.factories.contains_key(&name) {
            return Err(RegistryError::Duplicate {
                kind: self.kind,
                name,
            });
        }

        debug!(kind = self.kind, name = %name, "registered factory");
        self.factories.insert(name, Box::new(factory));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Ensure `name` is registered without constructing anything.
    pub fn check(&self, name: &str) -> Result<(), RegistryError> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(RegistryError::Unknown {
                kind: self.kind,
                name: name.to_string(),
            })
        }
    }

    /// Construct the instance registered under `name`.
    pub fn resolve(&self, name: &str, options: &Options) -> Result<Box<T>, RegistryError> {
        let factory = self.factories.get(name).ok_or_else(|| RegistryError::Unknown {
            kind: self.kind,
            name: name.to_string(),
        })?;

        factory(options).map_err(|source| RegistryError::Construction {
            kind: self.kind,
            name: name.to_string(),
            source,
        })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

impl<T: ?Sized> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("names", &self.names())
            .finish()
    }
}
