//! Two-priority worker pool for download tasks.
//!
//! A fixed set of tokio tasks drains two lock-free queues. Whenever a
//! worker is free it takes from the urgent queue first — the block the
//! caller is currently blocked on — and only then from the background
//! queue holding the rest of the prefetch window. There is no fairness
//! beyond that rule.
//!
//! Work items are plain boxed futures. A submitted item runs exactly once;
//! items still queued at shutdown are dropped, which the download task
//! treats as cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Scheduling class for a submitted work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// The caller is blocked on this item.
    Urgent,
    /// Speculative prefetch work.
    Background,
}

type WorkItem = BoxFuture<'static, ()>;

struct WorkerShared {
    urgent: SegQueue<WorkItem>,
    background: SegQueue<WorkItem>,
    wake: Notify,
    shutdown: AtomicBool,
}

/// Bounded set of worker tasks with an urgent and a background queue.
pub struct WorkerPool {
    shared: Arc<WorkerShared>,
}

impl WorkerPool {
    /// Spawn `workers` tasks onto the current tokio runtime.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "worker pool needs at least one worker");
        let shared = Arc::new(WorkerShared {
            urgent: SegQueue::new(),
            background: SegQueue::new(),
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
        });
        for id in 0..workers {
            let shared = Arc::clone(&shared);
            tokio::spawn(worker_loop(shared, id));
        }
        info!(workers, "worker pool started");
        Self { shared }
    }

    /// Enqueue a work item. Items submitted after shutdown are dropped.
    pub fn submit(&self, priority: Priority, item: impl std::future::Future<Output = ()> + Send + 'static) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            debug!("work item submitted after shutdown, dropping");
            return;
        }
        match priority {
            Priority::Urgent => self.shared.urgent.push(item.boxed()),
            Priority::Background => self.shared.background.push(item.boxed()),
        }
        self.shared.wake.notify_one();
    }

    /// Stop all workers. Queued items are dropped, not run.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.wake.notify_waiters();
        // Anything still queued will never run; dropping the futures lets
        // their owners observe cancellation.
        while self.shared.urgent.pop().is_some() {}
        while self.shared.background.pop().is_some() {}
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("urgent_queued", &self.shared.urgent.len())
            .field("background_queued", &self.shared.background.len())
            .finish()
    }
}

async fn worker_loop(shared: Arc<WorkerShared>, id: usize) {
    loop {
        // Arm the notifier before polling the queues so a submit racing
        // with the checks below still wakes this worker.
        let parked = shared.wake.notified();

        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if let Some(item) = shared.urgent.pop() {
            item.await;
            continue;
        }
        if let Some(item) = shared.background.pop() {
            item.await;
            continue;
        }
        parked.await;
    }
    debug!(worker = id, "worker exiting");
}
