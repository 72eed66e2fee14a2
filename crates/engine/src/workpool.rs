//! Optional bounded work pools for action-level fan-out.
//!
//! The engine treats a pool as an opaque enqueue primitive: a pool receives
//! a job and runs it under its own parallelism controls. Without a pool,
//! jobs are spawned directly.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::{Engine, Job};

/// An enqueue primitive for engine jobs.
pub trait WorkPool: Send + Sync {
    fn enqueue(&self, engine: Arc<Engine>, job: Job);
}

/// Semaphore-capped pool: at most `max_concurrent` jobs run at once;
/// excess jobs queue on the semaphore.
pub struct BoundedWorkPool {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl BoundedWorkPool {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.clamp(1, 64);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

impl WorkPool for BoundedWorkPool {
    fn enqueue(&self, engine: Arc<Engine>, job: Job) {
        let semaphore = self.semaphore.clone();
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // Semaphore closed; engine is shutting down.
            };
            engine.run_job(job).await;
        });
    }
}
