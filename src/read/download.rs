//! Download task: one ranged fetch into one block.
//!
//! Each scheduled block gets its own task, submitted to the shared worker
//! pool. The task owns the buffer while it fills it and installs it into
//! the block on completion; the terminal state is published exactly once
//! even when the task is cancelled, or dropped before it ever ran.

use std::future::Future;
use std::sync::Arc;

use blobfs_pool::PooledBuf;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::ReadError;
use crate::metrics::TransferMetrics;
use crate::read::block::ReadBlock;
use crate::store::{ObjectMeta, ObjectStore, RangeRequest, StoreError};

/// One ranged download of `[block.abs_start_off, min(end, object.size))`.
pub(crate) struct DownloadJob {
    pub(crate) block: Arc<ReadBlock>,
    pub(crate) buf: PooledBuf,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) object: ObjectMeta,
    /// Per-block cancel handle, flipped when the queue evicts the entry.
    pub(crate) cancel: watch::Receiver<bool>,
    /// Reader-wide cancel flag, flipped on destroy.
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) metrics: Arc<TransferMetrics>,
}

impl DownloadJob {
    /// Package the job for the worker pool.
    ///
    /// The guard travels with the future from the moment it is created, so
    /// a task dropped unpolled (worker shutdown) still publishes a
    /// terminal state and resolves every waiter.
    pub(crate) fn into_task(self) -> impl Future<Output = ()> + Send + 'static {
        let guard = FinishGuard {
            block: Some(Arc::clone(&self.block)),
        };
        async move {
            self.run().await;
            guard.defuse();
        }
    }

    async fn run(self) {
        let DownloadJob {
            block,
            mut buf,
            store,
            object,
            mut cancel,
            mut shutdown,
            metrics,
        } = self;

        if *cancel.borrow() || *shutdown.borrow() {
            trace!(off = block.abs_start_off(), "block cancelled before dispatch");
            block.finish(Err(ReadError::Cancelled));
            return;
        }

        let outcome = tokio::select! {
            res = fetch_into(&block, &mut buf, store.as_ref(), &object, &metrics) => res,
            _ = cancel.changed() => Err(ReadError::Cancelled),
            _ = shutdown.changed() => Err(ReadError::Cancelled),
        };

        match outcome {
            Ok(()) => {
                trace!(
                    off = block.abs_start_off(),
                    len = buf.len(),
                    "block downloaded"
                );
                block.finish(Ok(buf));
            }
            Err(err) => {
                if !matches!(err, ReadError::Cancelled) {
                    debug!(off = block.abs_start_off(), %err, "block download failed");
                }
                block.finish(Err(err));
            }
        }
    }
}

async fn fetch_into(
    block: &ReadBlock,
    buf: &mut PooledBuf,
    store: &dyn ObjectStore,
    object: &ObjectMeta,
    metrics: &TransferMetrics,
) -> Result<(), ReadError> {
    let start = block.abs_start_off();
    let limit = object.size.min(start + block.cap() as u64);
    let want = (limit - start) as usize;

    let mut reader = store
        .new_range_reader(RangeRequest {
            name: object.name.clone(),
            generation: object.generation,
            range: start..limit,
            read_compressed: false,
            read_handle: None,
        })
        .await
        .map_err(|err| map_store_error(err, object))?;

    while buf.len() < want {
        let room = want - buf.len();
        let dst = &mut buf.unfilled()[..room];
        let n = reader
            .read(dst)
            .await
            .map_err(|err| map_store_error(err, object))?;
        if n == 0 {
            break;
        }
        buf.advance(n);
        metrics.record_download(n);
    }
    Ok(())
}

fn map_store_error(err: StoreError, object: &ObjectMeta) -> ReadError {
    match err {
        // The pinned generation is gone: the remote object was replaced
        // under this handle and every cached assumption is stale.
        StoreError::NotFound(_) => ReadError::FileClobbered {
            name: object.name.clone(),
        },
        StoreError::Cancelled => ReadError::Cancelled,
        other => ReadError::DownloadFailed(other),
    }
}

struct FinishGuard {
    block: Option<Arc<ReadBlock>>,
}

impl FinishGuard {
    fn defuse(mut self) {
        self.block.take();
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            block.finish(Err(ReadError::Cancelled));
        }
    }
}
