use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{PgTaskError, Result};

/// Maximum number of blocking calls a worker runs at once by default.
pub const DEFAULT_WORKER_LIMIT: usize = 40;

/// Runs blocking closures on tokio's blocking thread pool.
///
/// The calling task is suspended, not the runtime thread, until the closure
/// finishes. Dropping the returned future does not stop the closure: it runs
/// to completion and its output is dropped on the blocking thread.
#[derive(Debug, Clone)]
pub struct Worker {
    limiter: Arc<Semaphore>,
}

impl Worker {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_WORKER_LIMIT)
    }

    /// Allow at most `limit` blocking calls in flight through this worker,
    /// including calls whose caller has stopped waiting.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limiter: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Run `f` off the async runtime and wait for its result.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .map_err(|e| PgTaskError::Worker(format!("worker is shut down: {}", e)))?;

        // The permit is released when the closure finishes, even if the
        // awaiting future has been dropped by then.
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
            .map_err(|e| PgTaskError::Worker(format!("blocking task join error: {}", e)))
    }

    /// Number of blocking calls that could start right now.
    pub fn available_permits(&self) -> usize {
        self.limiter.available_permits()
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}
