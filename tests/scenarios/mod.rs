//! Scenario-based tests for railyard

mod artifacts;
mod cancellation;
mod retry_behavior;
mod stage_ordering;
