//! Execution scheduler - determines which jobs of a stage to start next

use crate::core::{pipeline::JobGraph, state::JobState};
use std::fmt;
use std::str::FromStr;

/// Strategy for starting jobs within a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchedulingStrategy {
    /// One job at a time, in dependency order
    Sequential,

    /// Every ready job at once
    #[default]
    Parallel,

    /// At most N jobs of the stage at once
    LimitedParallel(usize),
}

impl fmt::Display for SchedulingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingStrategy::Sequential => f.write_str("sequential"),
            SchedulingStrategy::Parallel => f.write_str("parallel"),
            SchedulingStrategy::LimitedParallel(n) => write!(f, "parallel-limited({})", n),
        }
    }
}

impl FromStr for SchedulingStrategy {
    type Err = String;

    /// `sequential`, `parallel`, `parallel-limited` (4 jobs) or `parallel-limited:N`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None => match s {
                "sequential" => Ok(SchedulingStrategy::Sequential),
                "parallel" => Ok(SchedulingStrategy::Parallel),
                "parallel-limited" => Ok(SchedulingStrategy::LimitedParallel(4)),
                other => Err(format!("unknown strategy '{}'", other)),
            },
            Some(("parallel-limited", n)) => n
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .map(SchedulingStrategy::LimitedParallel)
                .ok_or_else(|| format!("invalid job limit '{}'", n)),
            Some((other, _)) => Err(format!("unknown strategy '{}'", other)),
        }
    }
}

/// Scheduler for determining which jobs to run
#[derive(Debug, Clone, Default)]
pub struct ExecutionScheduler {
    strategy: SchedulingStrategy,
}

impl ExecutionScheduler {
    pub fn new(strategy: SchedulingStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> SchedulingStrategy {
        self.strategy
    }

    /// Jobs of `stage` to start now
    pub fn next_jobs(&self, graph: &JobGraph, stage: usize) -> Vec<String> {
        let running = Self::running_in_stage(graph, stage);
        let limit = match self.strategy {
            SchedulingStrategy::Sequential => 1,
            SchedulingStrategy::Parallel => usize::MAX,
            SchedulingStrategy::LimitedParallel(max) => max,
        };

        let remaining = limit.saturating_sub(running);
        if remaining == 0 {
            return vec![];
        }

        graph
            .ready_jobs(stage)
            .into_iter()
            .take(remaining)
            .map(|n| n.job.name.clone())
            .collect()
    }

    fn running_in_stage(graph: &JobGraph, stage: usize) -> usize {
        graph
            .running_jobs()
            .iter()
            .filter(|n| n.job.stage_index == stage && matches!(n.state, JobState::Running { .. }))
            .count()
    }
}
