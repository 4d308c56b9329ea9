//! Prefetch queue bookkeeping.
//!
//! The queue owns every in-flight block for one reader, in strictly
//! increasing offset order with adjacent coverage. An entry bundles the
//! block with the cancel handle of its download; eviction flips the handle
//! and waits for the task to publish its terminal state, so a worker never
//! writes into a buffer the reader has given up on.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use tokio::sync::watch;

use crate::read::block::ReadBlock;

pub(crate) struct QueueEntry {
    block: Arc<ReadBlock>,
    cancel: watch::Sender<bool>,
}

impl QueueEntry {
    pub(crate) fn new(block: Arc<ReadBlock>, cancel: watch::Sender<bool>) -> Self {
        Self { block, cancel }
    }

    pub(crate) fn block(&self) -> &Arc<ReadBlock> {
        &self.block
    }

    /// Cancel the download and wait until the worker is done with the
    /// block. The buffer itself returns to the pool when the last
    /// reference (queue, task, kernel slices) drops.
    pub(crate) async fn evict(self) {
        let _ = self.cancel.send(true);
        self.block.ready().await;
    }
}

#[derive(Default)]
pub(crate) struct PrefetchQueue {
    entries: VecDeque<QueueEntry>,
}

impl PrefetchQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, entry: QueueEntry) {
        debug_assert!(
            self.entries
                .back()
                .map_or(true, |last| last.block().end_off() == entry.block().abs_start_off()),
            "queue entries must cover adjacent ranges"
        );
        self.entries.push_back(entry);
    }

    pub(crate) fn front(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    pub(crate) fn pop(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Absolute byte range the queued blocks cover, if any.
    pub(crate) fn window(&self) -> Option<Range<u64>> {
        let head = self.entries.front()?.block().abs_start_off();
        let tail = self.entries.back()?.block().end_off();
        Some(head..tail)
    }
}
