//! Shared per-mount state.
//!
//! Open handles are independent except for two couplings: the worker pool
//! that executes downloads and the global block budget. Both live here,
//! built once per mount, and handed by reference to every reader and
//! writer constructor.

use std::sync::Arc;

use blobfs_pool::GlobalBudget;

use crate::metrics::TransferMetrics;
use crate::workers::WorkerPool;

/// Worker pool, global block budget, and counters shared by every handle.
#[derive(Debug)]
pub struct TransferContext {
    workers: Arc<WorkerPool>,
    budget: GlobalBudget,
    metrics: Arc<TransferMetrics>,
}

impl TransferContext {
    /// Build the shared state: `worker_threads` download workers and a
    /// global budget of `budget_blocks` blocks.
    #[must_use]
    pub fn new(worker_threads: usize, budget_blocks: usize) -> Self {
        Self {
            workers: Arc::new(WorkerPool::new(worker_threads)),
            budget: GlobalBudget::new(budget_blocks),
            metrics: Arc::new(TransferMetrics::new()),
        }
    }

    /// The download worker pool.
    #[must_use]
    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// The process-wide block budget.
    #[must_use]
    pub fn budget(&self) -> &GlobalBudget {
        &self.budget
    }

    /// Shared transfer counters.
    #[must_use]
    pub fn metrics(&self) -> &Arc<TransferMetrics> {
        &self.metrics
    }
}
