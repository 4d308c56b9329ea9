//! Single-writer streaming uploader.
//!
//! Blocks arrive on an unbounded channel in strictly increasing stream
//! order and one worker drains them FIFO, so the remote object is
//! assembled in order. The store writer is created lazily on the first
//! upload: for an unfinalized appendable object on a zonal bucket it
//! reopens at the current object size, otherwise it starts a fresh
//! resumable upload.
//!
//! The first error latches. Later blocks are drained without transfer,
//! and `flush_pending_writes` / `finalize` keep reporting the latched
//! error. A copy cancelled mid-flight is silent success: the only path
//! that cancels is unlink from the same mount, where the bytes are
//! forgotten like a local filesystem would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::TransferConfig;
use crate::error::WriteError;
use crate::metrics::TransferMetrics;
use crate::store::{
    AppendableWriteRequest, BucketKind, ObjectMeta, ObjectStore, ObjectStub, ObjectWriter,
    ResumableWriteRequest, StoreError,
};
use crate::write::block::WriteBlock;

struct UploadShared {
    writer: Mutex<Option<Box<dyn ObjectWriter>>>,
    /// Blocks handed to the channel and not yet released.
    pending: AtomicUsize,
    drained: Notify,
    /// First upload failure; set at most once.
    error: OnceCell<WriteError>,
    metrics: Arc<TransferMetrics>,
}

impl UploadShared {
    fn latch(&self, err: WriteError) {
        let _ = self.error.set(err);
    }

    fn release_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// Streams ordered blocks into one resumable store upload.
pub(crate) struct Uploader {
    store: Arc<dyn ObjectStore>,
    object: ObjectMeta,
    chunk_size: usize,
    chunk_transfer_timeout: std::time::Duration,
    retry_deadline: std::time::Duration,

    shared: Arc<UploadShared>,
    tx: Option<mpsc::UnboundedSender<WriteBlock>>,
    worker: Option<JoinHandle<()>>,
    cancel: watch::Sender<bool>,
}

impl Uploader {
    pub(crate) fn new(
        store: Arc<dyn ObjectStore>,
        object: ObjectMeta,
        cfg: &TransferConfig,
        metrics: Arc<TransferMetrics>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            store,
            object,
            chunk_size: cfg.block_size(),
            chunk_transfer_timeout: cfg.chunk_transfer_timeout(),
            retry_deadline: cfg.chunk_retry_deadline(),
            shared: Arc::new(UploadShared {
                writer: Mutex::new(None),
                pending: AtomicUsize::new(0),
                drained: Notify::new(),
                error: OnceCell::new(),
                metrics,
            }),
            tx: None,
            worker: None,
            cancel,
        }
    }

    /// The latched upload error, if any.
    pub(crate) fn error(&self) -> Option<WriteError> {
        self.shared.error.get().cloned()
    }

    /// Queue one block for upload. Fails fast once an error is latched.
    pub(crate) async fn upload(&mut self, block: WriteBlock) -> Result<(), WriteError> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        self.ensure_writer().await?;
        let tx = self.ensure_worker();

        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if tx.send(block).is_err() {
            // Channel closed by a finalize/destroy racing this upload.
            self.shared.release_one();
            let err = WriteError::Upload(StoreError::Cancelled);
            self.shared.latch(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Wait until every queued block has been released.
    pub(crate) async fn await_blocks_upload(&self) {
        loop {
            let drained = self.shared.drained.notified();
            if self.shared.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Make the bytes uploaded so far queryable. Zonal buckets only.
    pub(crate) async fn flush_pending_writes(&mut self) -> Result<ObjectStub, WriteError> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        self.await_blocks_upload().await;
        if let Some(err) = self.error() {
            return Err(err);
        }
        self.ensure_writer().await?;

        let mut writer = self.shared.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => match writer.flush_pending().await {
                Ok(stub) => Ok(stub),
                Err(err) => {
                    let err = WriteError::Upload(err);
                    self.shared.latch(err.clone());
                    Err(err)
                }
            },
            None => Err(WriteError::Upload(StoreError::Cancelled)),
        }
    }

    /// Complete the upload: drain the queue, close the channel, and
    /// finalize the store writer (creating one for a zero-length object).
    pub(crate) async fn finalize(&mut self) -> Result<ObjectStub, WriteError> {
        if let Some(err) = self.error() {
            return Err(err);
        }
        self.await_blocks_upload().await;
        self.close_channel().await;
        if let Some(err) = self.error() {
            return Err(err);
        }
        self.ensure_writer().await?;

        let mut writer = self.shared.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => match writer.finalize().await {
                Ok(stub) => {
                    debug!(object = %stub.name, size = stub.size, "upload finalized");
                    Ok(stub)
                }
                Err(err) => {
                    let err = WriteError::Upload(err);
                    self.shared.latch(err.clone());
                    Err(err)
                }
            },
            None => Err(WriteError::Upload(StoreError::Cancelled)),
        }
    }

    /// Abort the in-flight transfer and wait for queued blocks to be
    /// released. Skipped transfers are not errors.
    pub(crate) async fn cancel_upload(&mut self) {
        let _ = self.cancel.send(true);
        self.await_blocks_upload().await;
    }

    /// Drain pending entries back to the pool and close the channel.
    pub(crate) async fn destroy(&mut self) {
        let _ = self.cancel.send(true);
        self.close_channel().await;
    }

    async fn close_channel(&mut self) {
        self.tx = None;
        if let Some(worker) = self.worker.take() {
            // The worker drains remaining blocks (releasing their buffers)
            // and exits once the channel is empty.
            let _ = worker.await;
        }
    }

    /// Create the store writer if it does not exist yet.
    async fn ensure_writer(&self) -> Result<(), WriteError> {
        let mut writer = self.shared.writer.lock().await;
        if writer.is_some() {
            return Ok(());
        }
        let created = if self.store.bucket_kind() == BucketKind::Zonal && self.object.size > 0 {
            // Continue the unfinalized appendable object where it stands.
            self.store
                .new_appendable_writer(AppendableWriteRequest {
                    name: self.object.name.clone(),
                    start_offset: self.object.size,
                    chunk_size: self.chunk_size,
                })
                .await
        } else {
            self.store
                .new_resumable_writer(ResumableWriteRequest {
                    name: self.object.name.clone(),
                    generation_precondition: Some(self.object.generation),
                    chunk_size: self.chunk_size,
                    chunk_transfer_timeout: self.chunk_transfer_timeout,
                    retry_deadline: self.retry_deadline,
                })
                .await
        };
        match created {
            Ok(w) => {
                *writer = Some(w);
                Ok(())
            }
            Err(err) => {
                let err = WriteError::Upload(err);
                self.shared.latch(err.clone());
                Err(err)
            }
        }
    }

    /// Start the uploader worker if it is not running.
    fn ensure_worker(&mut self) -> mpsc::UnboundedSender<WriteBlock> {
        if let Some(tx) = &self.tx {
            return tx.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = Some(tx.clone());
        self.worker = Some(tokio::spawn(upload_loop(
            rx,
            Arc::clone(&self.shared),
            self.cancel.subscribe(),
        )));
        tx
    }
}

async fn upload_loop(
    mut rx: mpsc::UnboundedReceiver<WriteBlock>,
    shared: Arc<UploadShared>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut last_off: Option<u64> = None;
    while let Some(block) = rx.recv().await {
        debug_assert!(
            block.abs_start_off() > last_off || last_off.is_none(),
            "upload blocks must arrive in stream order"
        );
        last_off = block.abs_start_off();

        let skip = shared.error.get().is_some() || *cancel.borrow();
        if !skip {
            let result = {
                let mut writer = shared.writer.lock().await;
                match writer.as_mut() {
                    Some(writer) => {
                        tokio::select! {
                            res = writer.write_all(block.as_slice()) => res,
                            _ = cancel.changed() => Err(StoreError::Cancelled),
                        }
                    }
                    // upload() creates the writer before queueing.
                    None => Err(StoreError::Transport("writer missing".to_owned())),
                }
            };
            match result {
                Ok(()) => shared.metrics.record_upload(block.len()),
                Err(StoreError::Cancelled) => {
                    // Unlinked from the same mount; forget the bytes.
                    debug!("upload copy cancelled, treating as success");
                }
                Err(err) => {
                    warn!(%err, "upload failed, latching error");
                    shared.latch(WriteError::Upload(err));
                }
            }
        }
        drop(block); // buffer back to the pool
        shared.release_one();
    }
}
