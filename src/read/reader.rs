//! Buffered reader: the front door for kernel reads.
//!
//! The reader turns randomly timed kernel `read_at` calls into a pipeline
//! of ranged downloads. It keeps a queue of in-flight blocks, grows its
//! prefetch window multiplicatively while the pattern stays sequential,
//! and hands the kernel zero-copy slices into downloaded blocks. When the
//! pattern turns out to be random — or the block pool cannot feed the
//! pipeline — it tells the caller to fall back to a simpler reader.
//!
//! The kernel layer serializes calls per handle, which is why every entry
//! point takes `&mut self`; slice releases are the only concurrent
//! touches, and they only walk `Arc`s.

use std::sync::Arc;
use std::time::Duration;

use blobfs_pool::{BlockPool, PoolError, PooledBuf};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::config::TransferConfig;
use crate::context::TransferContext;
use crate::error::ReadError;
use crate::metrics::TransferMetrics;
use crate::read::block::{BlockSlice, BlockState, ReadBlock, SliceRegistry};
use crate::read::download::DownloadJob;
use crate::read::queue::{PrefetchQueue, QueueEntry};
use crate::store::{ObjectMeta, ObjectStore};
use crate::workers::{Priority, WorkerPool};

/// Window growth factor applied after every fully scheduled prefetch round.
const PREFETCH_MULTIPLIER: usize = 2;

/// How long `destroy` waits for the kernel to return outstanding slices.
const DESTROY_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of one `read_at` call: direct views into downloaded blocks.
///
/// Dropping the response releases every referenced block — it is the
/// kernel's completion callback.
pub struct ReadResponse {
    slices: Vec<BlockSlice>,
    size: usize,
}

impl ReadResponse {
    /// The data, in order, as block-backed slices.
    #[must_use]
    pub fn slices(&self) -> &[BlockSlice] {
        &self.slices
    }

    /// Total bytes across all slices.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Concatenate the slices into one owned buffer.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for slice in &self.slices {
            out.extend_from_slice(slice);
        }
        out
    }
}

impl std::fmt::Debug for ReadResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadResponse")
            .field("size", &self.size)
            .field("slices", &self.slices.len())
            .finish()
    }
}

/// Prefetching reader for one open handle of one object generation.
pub struct BufferedReader {
    object: ObjectMeta,
    store: Arc<dyn ObjectStore>,
    workers: Arc<WorkerPool>,
    metrics: Arc<TransferMetrics>,
    pool: BlockPool,
    queue: PrefetchQueue,

    block_size: usize,
    total_blocks: u64,
    max_blocks: usize,
    initial_blocks: usize,

    /// Index of the next block to schedule.
    next_block_index: u64,
    /// Current prefetch window in blocks.
    window: usize,
    random_seek_count: u32,
    random_seek_threshold: u32,
    in_fallback: bool,

    /// Reader-wide cancel flag; flipped once, on destroy.
    shutdown: watch::Sender<bool>,
    slices: Arc<SliceRegistry>,
}

impl BufferedReader {
    /// Build a reader for an open handle.
    ///
    /// Fails when the global budget cannot supply even one reserved
    /// block; the caller should serve the handle through the simple
    /// reader instead.
    pub fn new(
        object: ObjectMeta,
        store: Arc<dyn ObjectStore>,
        ctx: &TransferContext,
        cfg: &TransferConfig,
    ) -> Result<Self, PoolError> {
        let block_size = cfg.block_size();
        let total_blocks = cfg.blocks_in_object(object.size);
        let pool = BlockPool::new(
            block_size,
            cfg.max_prefetch_block_cnt,
            total_blocks as usize,
            cfg.min_blocks_per_handle,
            ctx.budget().clone(),
        )?;
        let (shutdown, _) = watch::channel(false);
        debug!(
            object = %object.name,
            size = object.size,
            block_size,
            "buffered reader created"
        );
        Ok(Self {
            object,
            store,
            workers: Arc::clone(ctx.workers()),
            metrics: Arc::clone(ctx.metrics()),
            pool,
            queue: PrefetchQueue::new(),
            block_size,
            total_blocks,
            max_blocks: cfg.max_prefetch_block_cnt,
            initial_blocks: cfg.initial_prefetch_block_cnt,
            next_block_index: 0,
            window: 0,
            random_seek_count: 0,
            random_seek_threshold: cfg.random_seek_threshold,
            in_fallback: false,
            shutdown,
            slices: Arc::new(SliceRegistry::default()),
        })
    }

    /// Serve a kernel read of `len` bytes at absolute offset `off`.
    ///
    /// Returns direct slices into downloaded blocks; the kernel signals
    /// completion by dropping the response. A read that starts before the
    /// end of the object but runs past it returns the available prefix
    /// with `Ok`; only a read that begins at or past the end is `Eof`.
    pub async fn read_at(&mut self, len: usize, off: u64) -> Result<ReadResponse, ReadError> {
        if self.in_fallback {
            return Err(ReadError::FallbackToAnotherReader);
        }
        if off >= self.object.size {
            return Err(ReadError::Eof);
        }
        if len == 0 {
            return Ok(ReadResponse {
                slices: Vec::new(),
                size: 0,
            });
        }
        self.classify_seek(off).await?;

        let mut slices = Vec::new();
        let mut size = 0usize;
        let mut off = off;
        let mut popped_this_call = false;

        while size < len && off < self.object.size {
            self.align_head(off).await;

            if self.queue.is_empty() {
                if let Err(err) = self.fresh_start(off) {
                    debug!(%err, off, "cannot refill pipeline, requesting fallback");
                    self.metrics.record_fallback();
                    return Err(ReadError::FallbackToAnotherReader);
                }
            }

            let head = match self.queue.front() {
                Some(entry) => Arc::clone(entry.block()),
                None => break,
            };
            match head.ready().await {
                BlockState::Downloaded { len: block_len } => {
                    let rel = (off - head.abs_start_off()) as usize;
                    if rel >= block_len {
                        // The block holds fewer bytes than its range
                        // promised mid-object; the remote object shrank.
                        drop(self.queue.pop());
                        return Err(ReadError::DownloadFailed(
                            crate::store::StoreError::Transport(
                                "object shorter than expected".to_owned(),
                            ),
                        ));
                    }
                    let n = (len - size).min(block_len - rel);
                    slices.push(head.slice(rel..rel + n, &self.slices));
                    off += n as u64;
                    size += n;
                    if off >= head.abs_start_off() + block_len as u64 {
                        self.pop_head(&mut popped_this_call);
                    }
                }
                BlockState::Failed(err) => {
                    drop(self.queue.pop());
                    return Err(err);
                }
                // `ready` only resolves on terminal states.
                BlockState::InProgress => continue,
            }
        }

        trace!(off, size, "read served");
        Ok(ReadResponse { slices, size })
    }

    /// Tear the reader down: cancel and drop every queued block, wait
    /// (bounded) for the kernel to return outstanding slices, cancel all
    /// remaining downloads, and give the pool's memory back.
    pub async fn destroy(&mut self) {
        while let Some(entry) = self.queue.pop() {
            entry.evict().await;
        }
        if tokio::time::timeout(DESTROY_DRAIN_TIMEOUT, self.slices.wait_idle())
            .await
            .is_err()
        {
            warn!(
                object = %self.object.name,
                live = self.slices.live(),
                "destroying reader with outstanding block references"
            );
        }
        let _ = self.shutdown.send(true);
        self.pool.clear_free(true);
        debug!(object = %self.object.name, "buffered reader destroyed");
    }

    /// Random seeks observed so far.
    #[must_use]
    pub fn random_seek_count(&self) -> u32 {
        self.random_seek_count
    }

    /// Blocks currently queued.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Current prefetch window in blocks.
    #[must_use]
    pub fn prefetch_window(&self) -> usize {
        self.window
    }

    /// Classify this read as sequential or random; on a random read,
    /// discard the pipeline and, past the threshold, latch the fallback.
    async fn classify_seek(&mut self, off: u64) -> Result<(), ReadError> {
        let random = match self.queue.window() {
            Some(window) => !window.contains(&off),
            None => off != 0,
        };
        if !random {
            return Ok(());
        }

        self.random_seek_count += 1;
        trace!(off, seeks = self.random_seek_count, "random read detected");
        self.discard_queue().await;

        if self.random_seek_count > self.random_seek_threshold {
            debug!(
                object = %self.object.name,
                seeks = self.random_seek_count,
                "random-seek threshold exceeded, requesting fallback"
            );
            self.in_fallback = true;
            self.metrics.record_fallback();
            return Err(ReadError::FallbackToAnotherReader);
        }
        Ok(())
    }

    /// Pop and evict queue heads until the head covers `off`.
    async fn align_head(&mut self, off: u64) {
        loop {
            let covers = match self.queue.front() {
                None => break,
                Some(entry) => {
                    let block = entry.block();
                    off >= block.abs_start_off() && off < block.end_off()
                }
            };
            if covers {
                break;
            }
            if let Some(entry) = self.queue.pop() {
                entry.evict().await;
                self.metrics.record_eviction();
            }
        }
    }

    async fn discard_queue(&mut self) {
        while let Some(entry) = self.queue.pop() {
            entry.evict().await;
            self.metrics.record_eviction();
        }
    }

    fn pop_head(&mut self, popped_this_call: &mut bool) {
        drop(self.queue.pop());
        if !*popped_this_call {
            *popped_this_call = true;
            // One refill per call keeps the pipeline fed without letting a
            // single large read schedule unboundedly.
            self.prefetch();
        }
    }

    /// Restart the pipeline at `off`: reset the window, schedule the block
    /// the caller is blocked on as urgent, then top up opportunistically.
    fn fresh_start(&mut self, off: u64) -> Result<(), PoolError> {
        self.next_block_index = off / self.block_size as u64;
        self.window = self.initial_blocks.min(self.max_blocks);
        self.schedule_next_block(Priority::Urgent)?;
        // Failure to top up is not fatal; the urgent block is in flight.
        self.prefetch();
        Ok(())
    }

    /// Schedule up to one window of background blocks. Stops early without
    /// growing the window when the pool is out of buffers.
    fn prefetch(&mut self) {
        let room = self.max_blocks.saturating_sub(self.queue.len());
        let left_in_file = self
            .total_blocks
            .saturating_sub(self.next_block_index)
            .min(usize::MAX as u64) as usize;
        let want = self.window.min(room).min(left_in_file);

        for scheduled in 0..want {
            if let Err(err) = self.schedule_next_block(Priority::Background) {
                debug!(scheduled, want, %err, "prefetch stopped, pool exhausted");
                return;
            }
        }
        self.window = (self.window * PREFETCH_MULTIPLIER).min(self.max_blocks);
    }

    /// Acquire a block, bind it to the next block index, and submit its
    /// download. The index advances only on success.
    fn schedule_next_block(&mut self, priority: Priority) -> Result<(), PoolError> {
        let buf: PooledBuf = self.pool.try_get()?;
        let abs_start_off = self.next_block_index * self.block_size as u64;
        let block = Arc::new(ReadBlock::new(abs_start_off, self.block_size));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let job = DownloadJob {
            block: Arc::clone(&block),
            buf,
            store: Arc::clone(&self.store),
            object: self.object.clone(),
            cancel: cancel_rx,
            shutdown: self.shutdown.subscribe(),
            metrics: Arc::clone(&self.metrics),
        };
        self.queue.push(QueueEntry::new(block, cancel_tx));
        self.workers.submit(priority, job.into_task());
        self.next_block_index += 1;
        trace!(abs_start_off, ?priority, "block scheduled");
        Ok(())
    }
}

impl std::fmt::Debug for BufferedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedReader")
            .field("object", &self.object.name)
            .field("queue_len", &self.queue.len())
            .field("window", &self.window)
            .field("random_seek_count", &self.random_seek_count)
            .field("in_fallback", &self.in_fallback)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mem::InMemoryStore;
    use crate::store::BucketKind;

    const B: u64 = 1024;

    fn config() -> TransferConfig {
        TransferConfig {
            prefetch_block_size_bytes: B,
            max_prefetch_block_cnt: 10,
            initial_prefetch_block_cnt: 2,
            min_blocks_per_handle: 2,
            random_seek_threshold: 2,
            ..TransferConfig::default()
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn reader_for(
        data: &[u8],
        cfg: &TransferConfig,
        workers: usize,
    ) -> (BufferedReader, Arc<InMemoryStore>, TransferContext) {
        let ctx = TransferContext::new(workers, 64);
        let store = Arc::new(InMemoryStore::new(BucketKind::Standard));
        let object = store.put_object("obj", data);
        let reader = BufferedReader::new(
            object,
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            &ctx,
            cfg,
        )
        .unwrap();
        (reader, store, ctx)
    }

    #[tokio::test]
    async fn sequential_read_returns_object_bytes() {
        let data = pattern(3 * B as usize);
        let (mut reader, store, _ctx) = reader_for(&data, &config(), 2).await;

        for i in 0..3u64 {
            let resp = reader.read_at(B as usize, i * B).await.unwrap();
            assert_eq!(resp.size(), B as usize);
            assert_eq!(
                resp.to_vec(),
                data[(i * B) as usize..((i + 1) * B) as usize]
            );
        }
        assert_eq!(reader.random_seek_count(), 0);
        assert_eq!(store.range_reads().len(), 3);
        reader.destroy().await;
    }

    #[tokio::test]
    async fn read_past_end_is_eof() {
        let data = pattern(B as usize);
        let (mut reader, _store, _ctx) = reader_for(&data, &config(), 2).await;
        assert_eq!(reader.read_at(10, B).await.unwrap_err(), ReadError::Eof);
        reader.destroy().await;
    }

    #[tokio::test]
    async fn read_across_end_returns_short_prefix() {
        let data = pattern((B + 100) as usize);
        let (mut reader, _store, _ctx) = reader_for(&data, &config(), 2).await;

        let resp = reader.read_at(B as usize, B).await.unwrap();
        assert_eq!(resp.size(), 100);
        assert_eq!(resp.to_vec(), data[B as usize..]);
        reader.destroy().await;
    }

    #[tokio::test]
    async fn empty_read_is_empty_success() {
        let data = pattern(B as usize);
        let (mut reader, _store, _ctx) = reader_for(&data, &config(), 2).await;
        let resp = reader.read_at(0, 0).await.unwrap();
        assert_eq!(resp.size(), 0);
        reader.destroy().await;
    }

    #[tokio::test]
    async fn forward_skip_evicts_stale_blocks() {
        let data = pattern(5 * B as usize);
        let cfg = TransferConfig {
            initial_prefetch_block_cnt: 3,
            ..config()
        };
        let (mut reader, store, ctx) = reader_for(&data, &cfg, 2).await;

        // Populate the queue with blocks at {0, B, 2B}.
        let first = reader.read_at(10, 0).await.unwrap();
        assert_eq!(reader.queue_len(), 3);
        drop(first);

        // Skipping forward inside the queued window is still sequential.
        let resp = reader.read_at(10, 2 * B).await.unwrap();
        assert_eq!(resp.size(), 10);
        assert_eq!(resp.to_vec(), data[2 * B as usize..2 * B as usize + 10]);
        assert_eq!(reader.random_seek_count(), 0);
        assert_eq!(ctx.metrics().snapshot().blocks_evicted, 2);
        drop(resp);

        // Consuming the rest of the head block triggers the next prefetch
        // round, which schedules the remaining blocks at 3B and 4B.
        let resp = reader
            .read_at((B - 10) as usize, 2 * B + 10)
            .await
            .unwrap();
        assert_eq!(resp.size(), (B - 10) as usize);
        drop(resp);

        let offsets: Vec<u64> = store.range_reads().iter().map(|(_, r)| r.start).collect();
        assert!(offsets.contains(&(3 * B)));
        assert!(offsets.contains(&(4 * B)));
        reader.destroy().await;
    }

    #[tokio::test]
    async fn random_seeks_latch_fallback_past_threshold() {
        let data = pattern(8 * B as usize);
        let (mut reader, _store, _ctx) = reader_for(&data, &config(), 2).await;

        // First read away from zero counts as the first random seek.
        reader.read_at(10, 2 * B).await.unwrap();
        assert_eq!(reader.random_seek_count(), 1);

        reader.read_at(10, 5 * B).await.unwrap();
        assert_eq!(reader.random_seek_count(), 2);

        assert_eq!(
            reader.read_at(10, 0).await.unwrap_err(),
            ReadError::FallbackToAnotherReader
        );
        // Latched: every further call falls back immediately.
        assert_eq!(
            reader.read_at(10, 6 * B).await.unwrap_err(),
            ReadError::FallbackToAnotherReader
        );
        reader.destroy().await;
    }

    #[tokio::test]
    async fn download_failure_surfaces_once_then_reader_recovers() {
        let data = pattern(2 * B as usize);
        let (mut reader, store, _ctx) = reader_for(&data, &config(), 2).await;
        store.fail_next_range_reader(crate::store::StoreError::Transport("boom".into()));

        let err = reader.read_at(B as usize, 0).await.unwrap_err();
        assert!(matches!(err, ReadError::DownloadFailed(_)));

        // The failed block was dropped; the same read works afterwards.
        let resp = reader.read_at(B as usize, 0).await.unwrap();
        assert_eq!(resp.to_vec(), data[..B as usize]);
        reader.destroy().await;
    }

    #[tokio::test]
    async fn clobbered_object_reports_name() {
        let data = pattern(B as usize);
        let (mut reader, store, _ctx) = reader_for(&data, &config(), 2).await;
        store.put_object("obj", b"replaced"); // bumps the generation

        let err = reader.read_at(16, 0).await.unwrap_err();
        assert_eq!(
            err,
            ReadError::FileClobbered {
                name: "obj".to_owned()
            }
        );
        reader.destroy().await;
    }

    #[tokio::test]
    async fn window_grows_multiplicatively_and_caps() {
        let data = pattern(64 * B as usize);
        let (mut reader, _store, _ctx) = reader_for(&data, &config(), 2).await;

        reader.read_at(B as usize, 0).await.unwrap();
        // fresh_start set the window to 2, both prefetch rounds succeeded:
        // 2 -> 4 -> 8.
        assert_eq!(reader.prefetch_window(), 8);
        assert!(reader.queue_len() <= 10);
        reader.destroy().await;
    }

    #[tokio::test]
    async fn destroy_waits_for_queue_and_releases_budget() {
        let data = pattern(4 * B as usize);
        let ctx = TransferContext::new(2, 8);
        let store = Arc::new(InMemoryStore::new(BucketKind::Standard));
        let object = store.put_object("obj", &data);
        let mut reader = BufferedReader::new(
            object,
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            &ctx,
            &config(),
        )
        .unwrap();

        reader.read_at(10, 0).await.unwrap();
        reader.destroy().await;
        drop(reader);
        assert_eq!(ctx.budget().available(), 8);
    }
}
