//! Bounded pool for blocking manager work.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};

/// Runs blocking jobs on Tokio's blocking threads, at most `size` at a time.
///
/// Jobs beyond the limit wait for a permit instead of piling onto the
/// blocking thread pool. Cloning shares the same limit.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by a running job.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.permits.available_permits()
    }

    /// Queue `job`. Must be called from within a Tokio runtime.
    pub fn spawn<F, T>(&self, job: F) -> JoinHandle<Result<T, JoinError>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            // The semaphore is never closed, so acquiring only waits.
            let _permit = permits.acquire_owned().await;
            tokio::task::spawn_blocking(job).await
        })
    }
}
