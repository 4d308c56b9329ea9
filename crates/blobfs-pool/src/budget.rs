//! Process-wide block budget.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::info;

/// Weighted semaphore shared by every [`crate::BlockPool`] in the process.
///
/// Capacity is counted in blocks, not bytes. Permits are detached from the
/// semaphore on acquire (`forget`) and re-added when a pool returns them, so
/// a permit can outlive the scope that took it and travel with the buffer it
/// paid for.
#[derive(Clone)]
pub struct GlobalBudget {
    sem: Arc<Semaphore>,
    capacity: usize,
}

impl GlobalBudget {
    /// Create a budget allowing `capacity_blocks` blocks across all pools.
    #[must_use]
    pub fn new(capacity_blocks: usize) -> Self {
        assert!(capacity_blocks > 0, "block budget must be > 0");
        info!(capacity_blocks, "global block budget created");
        Self {
            sem: Arc::new(Semaphore::new(capacity_blocks)),
            capacity: capacity_blocks,
        }
    }

    /// Total capacity in blocks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently unclaimed.
    #[must_use]
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    /// Take one permit without blocking. Returns `false` when none is free.
    pub(crate) fn try_take(&self) -> bool {
        match self.sem.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Take one permit, waiting for one to be returned if necessary.
    ///
    /// Returns `false` only if the semaphore was closed, which no code path
    /// in this crate does.
    pub(crate) async fn take(&self) -> bool {
        match self.sem.acquire().await {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Return `n` previously taken permits.
    pub(crate) fn put(&self, n: usize) {
        if n > 0 {
            self.sem.add_permits(n);
        }
    }
}

impl std::fmt::Debug for GlobalBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalBudget")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_and_put_round_trip() {
        let budget = GlobalBudget::new(2);
        assert!(budget.try_take());
        assert!(budget.try_take());
        assert!(!budget.try_take());
        assert_eq!(budget.available(), 0);

        budget.put(2);
        assert_eq!(budget.available(), 2);
    }

    #[tokio::test]
    async fn blocking_take_waits_for_put() {
        let budget = GlobalBudget::new(1);
        assert!(budget.try_take());

        let waiter = {
            let budget = budget.clone();
            tokio::spawn(async move { budget.take().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        budget.put(1);
        assert!(waiter.await.unwrap());
    }
}
