//! Per-handle block pool with a two-tier memory budget.
//!
//! A [`BlockPool`] dispenses fixed-capacity buffers for one open file
//! handle. Memory accounting happens in permits of the [`GlobalBudget`]: a
//! pool holds one permit per buffer it has created, plus up to
//! `reserved_quota` spare permits it keeps back so the handle never fully
//! loses its floor to other handles. Buffers return to the free list when
//! the last owner drops them; permits return to the budget only on
//! [`BlockPool::clear_free`] with `release_reserved` or on pool teardown.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::budget::GlobalBudget;

/// Allocation failures surfaced to the transfer paths.
///
/// Neither variant is fatal to the process: the read path reacts by falling
/// back to a simpler reader, the write path reports the failed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// No free buffer, no reserved permit, and no global permit right now.
    #[error("block pool cannot allocate without blocking")]
    CannotAllocate,
    /// The global budget could not supply even one reserved permit at pool
    /// construction.
    #[error("global block budget refused the minimum reservation")]
    CannotAllocateAny,
}

/// Kinds of block a [`BlockPool`] can dispense.
///
/// The pool itself only manages raw buffers; the read and write paths wrap
/// them into their own block types at acquisition time.
pub trait PoolBlock: Send + 'static {
    /// Wrap a freshly acquired buffer.
    fn from_buf(buf: PooledBuf) -> Self;
}

impl PoolBlock for PooledBuf {
    fn from_buf(buf: PooledBuf) -> Self {
        buf
    }
}

struct PoolState {
    /// Buffers in existence for this pool, free or lent out.
    total_created: usize,
    /// Permits this pool is entitled to keep back from the global budget.
    reserved_quota: usize,
    /// Reserved permits not currently embodied in a live buffer.
    reserved_free: usize,
}

struct PoolShared {
    buf_capacity: usize,
    max_blocks: usize,
    budget: GlobalBudget,
    free: SegQueue<Vec<u8>>,
    /// Signalled once per buffer returned to the free list.
    returned: Notify,
    state: Mutex<PoolState>,
    total_acquires: AtomicU64,
    total_recycles: AtomicU64,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        // Buffers still in the free list and unspent reserved permits each
        // embody one budget permit; hand them all back.
        let state = self.state.get_mut();
        let mut permits = state.reserved_free;
        while self.free.pop().is_some() {
            permits += 1;
        }
        self.budget.put(permits);
    }
}

/// Pool of fixed-capacity buffers for one open handle, generic over the
/// block kind it dispenses.
pub struct BlockPool<B: PoolBlock = PooledBuf> {
    shared: Arc<PoolShared>,
    _kind: PhantomData<fn() -> B>,
}

impl<B: PoolBlock> BlockPool<B> {
    /// Create a pool of up to `max_blocks` buffers of `buf_capacity` bytes.
    ///
    /// Reserves `min(blocks_required, min_per_handle)` permits from
    /// `budget` up front. Permits are taken one at a time; obtaining fewer
    /// than requested shrinks the reservation, obtaining none while at
    /// least one was required fails with [`PoolError::CannotAllocateAny`].
    pub fn new(
        buf_capacity: usize,
        max_blocks: usize,
        blocks_required: usize,
        min_per_handle: usize,
        budget: GlobalBudget,
    ) -> Result<Self, PoolError> {
        assert!(buf_capacity > 0, "buffer capacity must be > 0");
        assert!(max_blocks > 0, "max_blocks must be > 0");

        let wanted = blocks_required.min(min_per_handle);
        let mut reserved = 0;
        while reserved < wanted && budget.try_take() {
            reserved += 1;
        }
        if wanted > 0 && reserved == 0 {
            warn!(wanted, "global budget exhausted, pool construction refused");
            return Err(PoolError::CannotAllocateAny);
        }
        if reserved < wanted {
            debug!(wanted, reserved, "pool reservation shrunk by budget pressure");
        }

        info!(
            buf_capacity,
            max_blocks, reserved, "block pool created"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                buf_capacity,
                max_blocks,
                budget,
                free: SegQueue::new(),
                returned: Notify::new(),
                state: Mutex::new(PoolState {
                    total_created: 0,
                    reserved_quota: reserved,
                    reserved_free: reserved,
                }),
                total_acquires: AtomicU64::new(0),
                total_recycles: AtomicU64::new(0),
            }),
            _kind: PhantomData,
        })
    }

    /// Acquire a block without blocking.
    ///
    /// Pops the free list first; otherwise creates a new buffer if the pool
    /// is below its ceiling and a permit is available (reserved first, then
    /// a non-blocking global acquire). Fails with
    /// [`PoolError::CannotAllocate`] otherwise.
    pub fn try_get(&self) -> Result<B, PoolError> {
        if let Some(buf) = self.shared.free.pop() {
            return Ok(B::from_buf(self.wrap(buf)));
        }
        let source = self.claim_creation_slot()?;
        self.create_buffer(source).map(B::from_buf)
    }

    /// Acquire a block, waiting until a buffer is returnable.
    ///
    /// Fails only when the buffer allocation itself fails; budget and
    /// ceiling pressure are waited out, not surfaced.
    pub async fn get(&self) -> Result<B, PoolError> {
        loop {
            // Arm the notifier before checking so a return racing with the
            // checks below still wakes us.
            let returned = self.shared.returned.notified();

            if let Some(buf) = self.shared.free.pop() {
                return Ok(B::from_buf(self.wrap(buf)));
            }

            match self.claim_creation_slot() {
                Ok(source) => return self.create_buffer(source).map(B::from_buf),
                Err(Claim::AtCeiling) => returned.await,
                Err(Claim::NoPermit) => {
                    tokio::select! {
                        ok = self.shared.budget.take() => {
                            if !ok {
                                return Err(PoolError::CannotAllocate);
                            }
                            // Re-check the ceiling: a buffer may have been
                            // created while we waited.
                            let mut state = self.shared.state.lock();
                            if state.total_created >= self.shared.max_blocks {
                                drop(state);
                                self.shared.budget.put(1);
                                continue;
                            }
                            state.total_created += 1;
                            drop(state);
                            return self.create_buffer(PermitSource::Global).map(B::from_buf);
                        }
                        () = returned => {}
                    }
                }
            }
        }
    }

    /// Drop every buffer in the free list.
    ///
    /// Freed permits refill the pool's reserved quota first and go back to
    /// the global budget beyond it. With `release_reserved` the quota
    /// itself is surrendered as well (handle teardown / final flush).
    pub fn clear_free(&self, release_reserved: bool) {
        let mut state = self.shared.state.lock();
        let mut freed = 0;
        while self.shared.free.pop().is_some() {
            freed += 1;
        }
        state.total_created -= freed;

        let mut to_global = 0;
        for _ in 0..freed {
            if !release_reserved && state.reserved_free < state.reserved_quota {
                state.reserved_free += 1;
            } else {
                to_global += 1;
            }
        }
        if release_reserved {
            to_global += state.reserved_free;
            state.reserved_free = 0;
            state.reserved_quota = 0;
        }
        drop(state);

        self.shared.budget.put(to_global);
        debug!(freed, release_reserved, to_global, "cleared pool free list");
    }

    /// Capacity in bytes of every buffer this pool dispenses.
    #[must_use]
    pub fn buf_capacity(&self) -> usize {
        self.shared.buf_capacity
    }

    /// Buffers currently in existence for this pool, free or lent out.
    #[must_use]
    pub fn total_created(&self) -> usize {
        self.shared.state.lock().total_created
    }

    /// Unspent reserved permits.
    #[must_use]
    pub fn reserved_free(&self) -> usize {
        self.shared.state.lock().reserved_free
    }

    /// Total block acquisitions since pool creation.
    #[must_use]
    pub fn total_acquires(&self) -> u64 {
        self.shared.total_acquires.load(Ordering::Relaxed)
    }

    fn wrap(&self, data: Vec<u8>) -> PooledBuf {
        self.shared.total_acquires.fetch_add(1, Ordering::Relaxed);
        PooledBuf {
            data,
            len: 0,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Reserve one creation slot (ceiling + permit) or report why not.
    fn claim_creation_slot(&self) -> Result<PermitSource, Claim> {
        let mut state = self.shared.state.lock();
        if state.total_created >= self.shared.max_blocks {
            return Err(Claim::AtCeiling);
        }
        let source = if state.reserved_free > 0 {
            state.reserved_free -= 1;
            PermitSource::Reserved
        } else if self.shared.budget.try_take() {
            PermitSource::Global
        } else {
            return Err(Claim::NoPermit);
        };
        state.total_created += 1;
        Ok(source)
    }

    fn create_buffer(&self, source: PermitSource) -> Result<PooledBuf, PoolError> {
        match alloc_buffer(self.shared.buf_capacity) {
            Ok(data) => Ok(self.wrap(data)),
            Err(err) => {
                warn!(capacity = self.shared.buf_capacity, %err, "buffer allocation failed");
                let mut state = self.shared.state.lock();
                state.total_created -= 1;
                match source {
                    PermitSource::Reserved => state.reserved_free += 1,
                    PermitSource::Global => {
                        drop(state);
                        self.shared.budget.put(1);
                    }
                }
                Err(PoolError::CannotAllocate)
            }
        }
    }
}

impl<B: PoolBlock> std::fmt::Debug for BlockPool<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BlockPool")
            .field("buf_capacity", &self.shared.buf_capacity)
            .field("max_blocks", &self.shared.max_blocks)
            .field("total_created", &state.total_created)
            .field("reserved_quota", &state.reserved_quota)
            .field("reserved_free", &state.reserved_free)
            .finish()
    }
}

enum PermitSource {
    Reserved,
    Global,
}

enum Claim {
    AtCeiling,
    NoPermit,
}

impl From<Claim> for PoolError {
    fn from(_: Claim) -> Self {
        PoolError::CannotAllocate
    }
}

impl<B: PoolBlock> Drop for BlockPool<B> {
    fn drop(&mut self) {
        self.clear_free(true);
    }
}

fn alloc_buffer(capacity: usize) -> Result<Vec<u8>, std::collections::TryReserveError> {
    let mut data = Vec::new();
    data.try_reserve_exact(capacity)?;
    data.resize(capacity, 0);
    Ok(data)
}

/// Fixed-capacity buffer on loan from a [`BlockPool`].
///
/// Tracks a fill level separately from its capacity: `append` and `advance`
/// grow the filled prefix, `as_slice` exposes it. Dropping the buffer
/// returns it to the pool's free list and wakes one blocked `get`.
pub struct PooledBuf {
    data: Vec<u8>,
    len: usize,
    shared: Arc<PoolShared>,
}

impl PooledBuf {
    /// Buffer capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Room left before the buffer is full.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    /// True when the filled prefix reaches capacity.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    /// The filled prefix.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Copy as much of `src` as fits; returns the number of bytes taken.
    pub fn append(&mut self, src: &[u8]) -> usize {
        let n = self.remaining().min(src.len());
        self.data[self.len..self.len + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// The unfilled tail, for direct reads into the buffer.
    pub fn unfilled(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.data[len..]
    }

    /// Mark `n` more bytes of the tail as filled.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the unfilled tail.
    pub fn advance(&mut self, n: usize) {
        assert!(
            self.len + n <= self.data.len(),
            "advance({}) past capacity ({})",
            n,
            self.data.len()
        );
        self.len += n;
    }

    /// Reset the fill level, keeping the allocation.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        if data.is_empty() {
            return;
        }
        self.shared.free.push(data);
        self.shared.total_recycles.fetch_add(1, Ordering::Relaxed);
        self.shared.returned.notify_one();
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .finish()
    }
}
