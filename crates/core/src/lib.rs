//! `optforge-core` — shared building blocks for the job subsystem.
//!
//! This crate contains **pure** primitives (no IO, no storage concerns).

pub mod error;
pub mod id;

pub use error::{Classified, DomainError};
pub use id::JobId;
