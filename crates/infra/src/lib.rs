//! Infrastructure layer: result store, job envelope, dispatcher, config.

pub mod config;
pub mod jobs;
