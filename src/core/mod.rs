//! Core domain models
//!
//! Trigger context, rules, job definitions, the pipeline file format and the
//! per-run job graph.

pub mod config;
pub mod context;
pub mod job;
pub mod pipeline;
pub mod rule;
pub mod state;
pub mod trigger;

pub use context::*;
pub use job::*;
pub use pipeline::*;
pub use state::*;
pub use trigger::*;
