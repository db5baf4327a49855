//! Cooperative cancellation and supersession of runs on the same ref

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Shared flag asking a run to stop
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Tracks the newest run per ref
#[derive(Debug, Default)]
pub struct PipelineRegistry {
    runs: Mutex<HashMap<String, (Uuid, CancelFlag)>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a run and supersede any older run on the same ref
    pub async fn register(&self, ref_name: &str, execution_id: Uuid) -> CancelFlag {
        let flag = CancelFlag::new();
        let mut runs = self.runs.lock().await;
        if let Some((previous, old_flag)) = runs.insert(ref_name.to_string(), (execution_id, flag.clone())) {
            info!("Run {} on {} superseded by {}", previous, ref_name, execution_id);
            old_flag.raise();
        }
        flag
    }

    /// Forget a finished run, unless a newer one already replaced it
    pub async fn finish(&self, ref_name: &str, execution_id: Uuid) {
        let mut runs = self.runs.lock().await;
        if runs.get(ref_name).is_some_and(|(id, _)| *id == execution_id) {
            runs.remove(ref_name);
        }
    }

    /// Number of runs currently tracked
    pub async fn active(&self) -> usize {
        self.runs.lock().await.len()
    }
}
