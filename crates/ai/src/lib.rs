//! `optforge-ai`
//!
//! **Responsibility:** the boundary between the job layer and optimization routines.
//!
//! The routines themselves (and the completion backends they call) live outside this
//! workspace. This crate only fixes the contract the job layer relies on:
//! - an [`Optimizer`] compiles a [`Program`] against a trainset and reports progress
//!   through a synchronous callback,
//! - failures carry a stable classifier ([`OptimizerError`]),
//! - concrete routines and programs are late-bound by name through a [`Registry`].

pub mod optimizer;
pub mod registry;
pub mod result;

pub use optimizer::{Example, Optimizer, Options, Program};
pub use registry::{OptimizerRegistry, ProgramRegistry, Registry, RegistryError};
pub use result::{Compilation, Metrics, OptimizerError};
