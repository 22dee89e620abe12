//! Bounded worker pool shared by download batches

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::downloader::core::{DownloadError, Result};

/// Limits how many downloads run at once
///
/// Cloning shares the same permits, so several coordinators (or several
/// batches of one coordinator) built from one pool never exceed its size
/// together.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Pool running at most `size` downloads at once, and at least one
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Number of permits the pool was created with
    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by a running download
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free worker slot; the slot is released when the permit drops
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DownloadError::TaskPanicked {
                reason: "worker pool was closed".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_permits_are_shared_between_clones() {
        let pool = WorkerPool::new(2);
        let other = pool.clone();

        let first = pool.acquire().await.unwrap();
        let _second = other.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        drop(first);
        assert_eq!(other.available(), 1);
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
