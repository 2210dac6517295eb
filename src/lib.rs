//! Sandboxed judge engine
//!
//! Compiles submissions, runs them under resource limits and decides verdicts:
//! batch judging against test data, custom scoring evaluators, interactive
//! sessions and one-off execution. [`jobs::Engine`] is the entry point.

pub mod components;
pub mod config;
pub mod core;
pub mod engine;
pub mod jobs;

#[cfg(test)]
mod testing;

pub use config::EngineConfig;
pub use jobs::{Engine, EngineError, JobOutput, WorkerJob};
