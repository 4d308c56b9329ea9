//! Error types for the transfer core.
//!
//! Errors are split per direction. [`ReadError`] covers everything the
//! prefetching read path can hand back to the kernel-facing layer,
//! including the `FallbackToAnotherReader` control signal that tells the
//! caller to swap in a simpler non-prefetching reader. [`WriteError`]
//! covers the streaming upload path, where the first store failure latches
//! and every later write, sync, or flush reports it again.
//!
//! Both enums are `Clone` because terminal block states and the latched
//! upload error are observed from more than one place.

use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the buffered read path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    /// The read starts at or past the end of the object. Benign.
    #[error("offset is at or past the end of the object")]
    Eof,

    /// The access pattern cannot be served by the prefetcher; the caller
    /// should discard this reader and serve the handle through a simpler
    /// non-prefetching path.
    #[error("access pattern unsuited to prefetching")]
    FallbackToAnotherReader,

    /// A download observed `NotFound` for a pinned generation: the remote
    /// object was replaced or deleted under this handle.
    #[error("object {name:?} changed under an open handle")]
    FileClobbered {
        /// Object name whose generation vanished.
        name: String,
    },

    /// A block download terminated abnormally. The block has been released;
    /// the reader itself stays usable.
    #[error("block download failed")]
    DownloadFailed(#[source] StoreError),

    /// The wait for a block was cancelled.
    #[error("read cancelled")]
    Cancelled,
}

/// Errors surfaced by the buffered write path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// The kernel broke the append-only protocol: the write neither starts
    /// at the current end of data nor at a recorded truncation boundary.
    #[error("write at offset {offset} breaks append order (current size {size})")]
    OutOfOrderWrite {
        /// Offset the kernel supplied.
        offset: u64,
        /// Bytes accepted so far.
        size: u64,
    },

    /// The upload failed; latched on the handle, so every subsequent
    /// write, sync, flush, or finalize reports the same error.
    #[error("upload failed")]
    Upload(#[source] StoreError),

    /// The block pool could not supply a buffer.
    #[error("no block could be allocated for buffering the write")]
    CannotAllocate,

    /// A flushed object reported a size that does not match the bytes this
    /// handle accepted.
    #[error("flushed object size {got} does not match accepted size {want}")]
    SizeMismatch {
        /// Bytes this handle accepted from the kernel.
        want: u64,
        /// Size the store reported after the flush.
        got: u64,
    },
}

impl From<StoreError> for WriteError {
    fn from(err: StoreError) -> Self {
        WriteError::Upload(err)
    }
}

impl From<blobfs_pool::PoolError> for WriteError {
    fn from(_: blobfs_pool::PoolError) -> Self {
        WriteError::CannotAllocate
    }
}
