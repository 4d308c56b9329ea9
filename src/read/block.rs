//! Read-side blocks and the slices handed to the kernel.
//!
//! A [`ReadBlock`] covers one block-aligned range of the object. Its
//! absolute offset is fixed at construction and its state moves exactly
//! once, from in-progress to a terminal downloaded/failed value published
//! through a watch channel; every waiter observes the same terminal state.
//!
//! The kernel borrows downloaded bytes as [`BlockSlice`] guards instead of
//! copies. A guard keeps the block alive through an `Arc`, so a block can
//! be evicted from the prefetch queue while the kernel still holds its
//! bytes; the underlying buffer only returns to the pool when the last
//! guard drops. Dropping the guard is the `done` callback.

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use blobfs_pool::PooledBuf;
use once_cell::sync::OnceCell;
use tokio::sync::{watch, Notify};

use crate::error::ReadError;

/// Terminal state of a block download.
#[derive(Debug, Clone)]
pub(crate) enum BlockState {
    /// Download scheduled or running.
    InProgress,
    /// Download finished; `len` bytes of the block are valid.
    Downloaded {
        /// Valid bytes, at most the block capacity.
        len: usize,
    },
    /// Download terminated abnormally, including cancellation.
    Failed(ReadError),
}

/// One block-aligned range of the object being prefetched.
pub(crate) struct ReadBlock {
    abs_start_off: u64,
    cap: usize,
    data: OnceCell<PooledBuf>,
    state: watch::Sender<BlockState>,
}

impl ReadBlock {
    pub(crate) fn new(abs_start_off: u64, cap: usize) -> Self {
        let (state, _) = watch::channel(BlockState::InProgress);
        Self {
            abs_start_off,
            cap,
            data: OnceCell::new(),
            state,
        }
    }

    /// Absolute object offset this block starts at. Write-once: fixed for
    /// the lifetime of the block.
    pub(crate) fn abs_start_off(&self) -> u64 {
        self.abs_start_off
    }

    /// Capacity in bytes. The last block of an object downloads fewer.
    pub(crate) fn cap(&self) -> usize {
        self.cap
    }

    /// First offset past the range this block covers.
    pub(crate) fn end_off(&self) -> u64 {
        self.abs_start_off + self.cap as u64
    }

    /// Publish the terminal state. Returns `false` if the block already
    /// reached one; the first publication wins and later ones are ignored.
    pub(crate) fn finish(&self, outcome: Result<PooledBuf, ReadError>) -> bool {
        let terminal = match outcome {
            Ok(buf) => {
                let len = buf.len();
                if self.data.set(buf).is_err() {
                    return false;
                }
                BlockState::Downloaded { len }
            }
            Err(err) => BlockState::Failed(err),
        };
        // The buffer is installed before the state flips, so anyone who
        // observes Downloaded can read the data.
        self.state.send_if_modified(|state| {
            if matches!(state, BlockState::InProgress) {
                *state = terminal;
                true
            } else {
                false
            }
        })
    }

    /// Wait for the terminal state. Returns immediately once published;
    /// every caller sees the same value.
    pub(crate) async fn ready(&self) -> BlockState {
        let mut rx = self.state.subscribe();
        let result = rx
            .wait_for(|state| !matches!(state, BlockState::InProgress))
            .await;
        match result {
            Ok(state) => state.clone(),
            // The sender lives in `self`, so this arm is unreachable while
            // the block exists.
            Err(_) => BlockState::Failed(ReadError::Cancelled),
        }
    }

    /// Terminal state if already published.
    pub(crate) fn state(&self) -> BlockState {
        self.state.borrow().clone()
    }

    pub(crate) fn data(&self) -> Option<&PooledBuf> {
        self.data.get()
    }

    /// Hand out `range` of the downloaded bytes as a kernel-facing guard.
    pub(crate) fn slice(
        self: &Arc<Self>,
        range: Range<usize>,
        registry: &Arc<SliceRegistry>,
    ) -> BlockSlice {
        debug_assert!(
            matches!(self.state(), BlockState::Downloaded { len } if range.end <= len),
            "slice outside downloaded bytes"
        );
        registry.acquire();
        BlockSlice {
            block: Arc::clone(self),
            start: range.start,
            len: range.end - range.start,
            registry: Arc::clone(registry),
        }
    }
}

impl std::fmt::Debug for ReadBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBlock")
            .field("abs_start_off", &self.abs_start_off)
            .field("cap", &self.cap)
            .field("state", &self.state())
            .finish()
    }
}

/// Zero-copy view into one downloaded block.
///
/// Holds the block alive until dropped; dropping it is the kernel's way of
/// saying it is done with the bytes.
pub struct BlockSlice {
    block: Arc<ReadBlock>,
    start: usize,
    len: usize,
    registry: Arc<SliceRegistry>,
}

impl std::ops::Deref for BlockSlice {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self.block.data() {
            Some(buf) => &buf.as_slice()[self.start..self.start + self.len],
            // Slices are only created after a successful download.
            None => &[],
        }
    }
}

impl AsRef<[u8]> for BlockSlice {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for BlockSlice {
    fn drop(&mut self) {
        self.registry.release();
    }
}

impl std::fmt::Debug for BlockSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockSlice")
            .field("abs_start_off", &self.block.abs_start_off())
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

/// Count of slices the kernel has not returned yet, per reader.
///
/// `destroy` waits (bounded) on this before tearing the handle down.
#[derive(Debug, Default)]
pub(crate) struct SliceRegistry {
    live: AtomicUsize,
    idle: Notify,
}

impl SliceRegistry {
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn acquire(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        if self.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until every outstanding slice has been returned.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.live() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobfs_pool::{BlockPool, GlobalBudget};

    fn buf_with(content: &[u8]) -> PooledBuf {
        let budget = GlobalBudget::new(4);
        let pool: BlockPool = BlockPool::new(64, 4, 4, 1, budget).unwrap();
        let mut buf = pool.try_get().unwrap();
        buf.append(content);
        buf
    }

    #[tokio::test]
    async fn finish_publishes_exactly_once() {
        let block = ReadBlock::new(0, 64);
        assert!(block.finish(Ok(buf_with(b"abc"))));
        assert!(!block.finish(Err(ReadError::Cancelled)));
        assert!(matches!(block.ready().await, BlockState::Downloaded { len: 3 }));
    }

    #[tokio::test]
    async fn every_waiter_sees_the_terminal_state() {
        let block = Arc::new(ReadBlock::new(0, 64));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let block = Arc::clone(&block);
                tokio::spawn(async move { block.ready().await })
            })
            .collect();
        tokio::task::yield_now().await;

        block.finish(Err(ReadError::Cancelled));
        for waiter in waiters {
            assert!(matches!(
                waiter.await.unwrap(),
                BlockState::Failed(ReadError::Cancelled)
            ));
        }
    }

    #[tokio::test]
    async fn slices_keep_the_buffer_out_of_the_pool() {
        let budget = GlobalBudget::new(1);
        let pool: BlockPool = BlockPool::new(64, 1, 1, 1, budget).unwrap();
        let mut buf = pool.try_get().unwrap();
        buf.append(b"hello world");

        let registry = Arc::new(SliceRegistry::default());
        let block = Arc::new(ReadBlock::new(0, 64));
        block.finish(Ok(buf));

        let slice = block.slice(6..11, &registry);
        assert_eq!(&*slice, b"world");
        assert_eq!(registry.live(), 1);

        // Evict: drop the queue's reference while the slice is alive.
        drop(block);
        assert!(pool.try_get().is_err());

        drop(slice);
        assert_eq!(registry.live(), 0);
        assert!(pool.try_get().is_ok());
    }

    #[tokio::test]
    async fn wait_idle_returns_after_last_release() {
        let registry = Arc::new(SliceRegistry::default());
        let block = Arc::new(ReadBlock::new(0, 64));
        block.finish(Ok(buf_with(b"xy")));
        let slice = block.slice(0..2, &registry);

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(slice);
        waiter.await.unwrap();
    }
}
