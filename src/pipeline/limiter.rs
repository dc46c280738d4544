//! Bounded concurrency for recognition jobs.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{GlmOcrError, Result};

/// A counting semaphore gating every recognizer call.
///
/// Capacity is `max(1, limit)`; queued waiters are served in FIFO order
/// (the tokio semaphore is fair).
#[derive(Debug, Clone)]
pub struct AsyncLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl AsyncLimiter {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    #[inline]
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Wait for a slot. The permit releases on drop, including when a job
    /// aborts mid-recognition.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GlmOcrError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_limit_floor_is_one() {
        assert_eq!(AsyncLimiter::new(0).limit(), 1);
        assert_eq!(AsyncLimiter::new(4).limit(), 4);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let limiter = AsyncLimiter::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _permit = limiter.acquire().await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
