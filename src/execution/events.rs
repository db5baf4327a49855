//! Execution events and their subscribers

use crate::core::{job::FailureClass, state::{ExecutionStatus, StageStatus}};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        execution_id: Uuid,
        pipeline_name: String,
        total_jobs: usize,
    },
    StageStarted {
        stage: String,
    },
    JobStarted {
        job: String,
        attempt: u32,
    },
    JobRetrying {
        job: String,
        attempt: u32,
        class: FailureClass,
    },
    JobSucceeded {
        job: String,
        attempts: u32,
    },
    JobFailed {
        job: String,
        error: String,
        class: FailureClass,
        allowed: bool,
    },
    JobCancelled {
        job: String,
        reason: String,
    },
    JobSkipped {
        job: String,
        reason: String,
    },
    StageFinished {
        stage: String,
        status: StageStatus,
    },
    PipelineCompleted {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Fan-out of events to registered handlers
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.handlers.lock().await.push(Arc::new(handler));
    }

    /// Emit an event to all handlers
    pub async fn emit(&self, event: ExecutionEvent) {
        let handlers = self.handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }
}
