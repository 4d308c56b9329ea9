//! Buffered writer: the front door for kernel writes.
//!
//! Kernel writes must arrive strictly in order — at the current end of
//! data, or exactly at a previously recorded truncation boundary, in
//! which case the gap is filled with zeros first. Data is packed into
//! pool blocks and full blocks stream to the uploader immediately, so a
//! large write never lands in a local temp file.

use std::sync::Arc;

use blobfs_pool::{BlockPool, PoolError};
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use crate::config::TransferConfig;
use crate::context::TransferContext;
use crate::error::WriteError;
use crate::store::{BucketKind, ObjectMeta, ObjectStore, ObjectStub};
use crate::write::block::WriteBlock;
use crate::write::uploader::Uploader;

/// Zero padding is synthesized in slices of this size so a huge truncate
/// does not allocate the whole gap at once.
const PADDING_CHUNK: usize = 1024 * 1024;

/// Size and mtime the kernel should report for the file being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteFileInfo {
    /// Bytes the object will have, counting a pending truncation.
    pub total_size: u64,
    /// Pending modification time, if one was set.
    pub mtime: Option<DateTime<Utc>>,
}

/// Streaming writer for one open handle.
pub struct BufferedWriter {
    object: ObjectMeta,
    bucket_kind: BucketKind,
    pool: BlockPool<WriteBlock>,
    uploader: Uploader,
    block_size: usize,

    /// Bytes accepted from the kernel (plus the initial object size when
    /// continuing an appendable object).
    total_size: u64,
    /// Recorded truncation target, if any.
    truncated_size: Option<u64>,
    current: Option<WriteBlock>,
    mtime: Option<DateTime<Utc>>,
}

impl BufferedWriter {
    /// Build a writer for an open handle.
    pub fn new(
        object: ObjectMeta,
        store: Arc<dyn ObjectStore>,
        ctx: &TransferContext,
        cfg: &TransferConfig,
    ) -> Result<Self, PoolError> {
        let pool = BlockPool::new(
            cfg.block_size(),
            cfg.max_prefetch_block_cnt,
            cfg.max_prefetch_block_cnt,
            cfg.min_blocks_per_handle,
            ctx.budget().clone(),
        )?;
        let bucket_kind = store.bucket_kind();
        let uploader = Uploader::new(
            Arc::clone(&store),
            object.clone(),
            cfg,
            Arc::clone(ctx.metrics()),
        );
        debug!(object = %object.name, size = object.size, "buffered writer created");
        Ok(Self {
            total_size: object.size,
            object,
            bucket_kind,
            pool,
            uploader,
            block_size: cfg.block_size(),
            truncated_size: None,
            current: None,
            mtime: None,
        })
    }

    /// Accept one kernel write at absolute offset `off`.
    pub async fn write(&mut self, data: &[u8], off: u64) -> Result<(), WriteError> {
        if let Some(err) = self.uploader.error() {
            return Err(err);
        }
        if off != self.total_size {
            let at_truncation_boundary =
                self.truncated_size == Some(off) && off >= self.total_size;
            if !at_truncation_boundary {
                return Err(WriteError::OutOfOrderWrite {
                    offset: off,
                    size: self.total_size,
                });
            }
            // Grow the object to the truncation point with zeros; the
            // padding flows through the normal append path.
            self.pad_to(off).await?;
        }
        trace!(off, len = data.len(), "write accepted");
        self.append(data).await
    }

    /// Record a truncation. Only growing an object is supported; data
    /// motion happens lazily when a write lands at the boundary or at
    /// flush time.
    pub fn truncate(&mut self, size: u64) -> Result<(), WriteError> {
        if size < self.total_size {
            return Err(WriteError::OutOfOrderWrite {
                offset: size,
                size: self.total_size,
            });
        }
        self.truncated_size = Some(size);
        Ok(())
    }

    /// Push buffered data to the store and, on zonal buckets, make it
    /// queryable. Returns the store's view of the object when there is
    /// one.
    pub async fn sync(&mut self) -> Result<Option<ObjectStub>, WriteError> {
        if let Some(err) = self.uploader.error() {
            return Err(err);
        }
        if let Some(block) = self.current.take() {
            self.uploader.upload(block).await?;
        }
        self.uploader.await_blocks_upload().await;
        if let Some(err) = self.uploader.error() {
            return Err(err);
        }

        let stub = match self.bucket_kind {
            BucketKind::Zonal => {
                let stub = self.uploader.flush_pending_writes().await?;
                if stub.size != self.total_size {
                    return Err(WriteError::SizeMismatch {
                        want: self.total_size,
                        got: stub.size,
                    });
                }
                Some(stub)
            }
            BucketKind::Standard => None,
        };
        self.pool.clear_free(false);
        Ok(stub)
    }

    /// Final flush: complete any pending truncation, stream the tail
    /// block, finalize the upload, and give the pool's memory back.
    pub async fn flush(&mut self) -> Result<ObjectStub, WriteError> {
        if let Some(err) = self.uploader.error() {
            return Err(err);
        }
        if let Some(target) = self.truncated_size {
            if target > self.total_size {
                self.pad_to(target).await?;
            }
        }
        if let Some(block) = self.current.take() {
            self.uploader.upload(block).await?;
        }
        let stub = self.uploader.finalize().await?;
        self.pool.clear_free(true);
        debug!(object = %stub.name, size = stub.size, "writer flushed");
        Ok(stub)
    }

    /// Record the mtime to report and to stamp on the finalized object.
    pub fn set_mtime(&mut self, mtime: DateTime<Utc>) {
        self.mtime = Some(mtime);
    }

    /// Size and mtime the kernel should report while the write is open.
    #[must_use]
    pub fn write_file_info(&self) -> WriteFileInfo {
        WriteFileInfo {
            total_size: self.total_size.max(self.truncated_size.unwrap_or(0)),
            mtime: self.mtime,
        }
    }

    /// Tear the handle down without finalizing. Nothing becomes visible
    /// at the store.
    pub async fn destroy(&mut self) {
        self.uploader.destroy().await;
        self.current = None;
        self.pool.clear_free(true);
        debug!(object = %self.object.name, "buffered writer destroyed");
    }

    /// The file was unlinked: abort the transfer and drop buffered data.
    /// The handle may still be open, so reserved permits are kept.
    pub async fn unlink(&mut self) {
        self.uploader.cancel_upload().await;
        self.pool.clear_free(false);
    }

    /// Bytes accepted so far.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    async fn pad_to(&mut self, target: u64) -> Result<(), WriteError> {
        let chunk = vec![0u8; PADDING_CHUNK.min((target - self.total_size) as usize)];
        while self.total_size < target {
            let n = ((target - self.total_size) as usize).min(chunk.len());
            self.append(&chunk[..n]).await?;
        }
        Ok(())
    }

    /// Pack `data` into blocks, shipping each block as it fills. The pool
    /// acquisition may block while the handle is at its memory ceiling.
    async fn append(&mut self, mut data: &[u8]) -> Result<(), WriteError> {
        while !data.is_empty() {
            if self.current.is_none() {
                let mut block = self.pool.get().await?;
                block.bind_start(self.total_size);
                self.current = Some(block);
            }
            // Invariant: `current` is Some from here on.
            let Some(block) = self.current.as_mut() else {
                break;
            };
            let n = block.append(data);
            data = &data[n..];
            self.total_size += n as u64;
            if block.is_full() {
                let Some(full) = self.current.take() else {
                    break;
                };
                self.uploader.upload(full).await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for BufferedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedWriter")
            .field("object", &self.object.name)
            .field("total_size", &self.total_size)
            .field("truncated_size", &self.truncated_size)
            .field("buffered", &self.current.as_ref().map(WriteBlock::len))
            .finish()
    }
}
