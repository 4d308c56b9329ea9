//! Outbound object-store interface.
//!
//! The transfer core never talks to a network client directly; it consumes
//! the small trait surface below. Ranged reads pin an object generation so
//! a replaced object shows up as [`StoreError::NotFound`] rather than as
//! silently different bytes. Writers follow the resumable multi-part
//! protocol: bytes stream in order, nothing is visible until `finalize` —
//! except on zonal-style buckets, where `flush_pending` makes buffered
//! bytes queryable early.
//!
//! The always-available in-memory implementation lives in [`mem`].

pub mod mem;

use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from the object store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The named object (at the pinned generation) does not exist.
    #[error("object {0:?} not found")]
    NotFound(String),

    /// A generation precondition on a write was not met.
    #[error("generation precondition failed for {0:?}")]
    PreconditionFailed(String),

    /// The transfer was cancelled before it completed.
    #[error("transfer cancelled")]
    Cancelled,

    /// Transport-level failure talking to the service.
    #[error("object store transport error: {0}")]
    Transport(String),
}

/// Convenience alias for store results.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Flavor of bucket backing the mount.
///
/// Zonal-style buckets support appendable objects and intermediate
/// flushes; standard buckets only expose finalized objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    /// Regional/standard bucket: resumable uploads, visible on finalize.
    Standard,
    /// Zonal bucket: appendable objects, flushable before finalize.
    Zonal,
}

/// Identity of the remote object an open handle is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object name within the bucket.
    pub name: String,
    /// Generation the handle is pinned to. Zero means "latest".
    pub generation: i64,
    /// Object size in bytes at open time.
    pub size: u64,
}

/// Parameters for one ranged download.
#[derive(Debug, Clone)]
pub struct RangeRequest {
    /// Object name.
    pub name: String,
    /// Generation to pin the read to.
    pub generation: i64,
    /// Absolute byte range `[start, end)`.
    pub range: Range<u64>,
    /// Ask the service for the compressed representation.
    pub read_compressed: bool,
    /// Opaque resume token from a previous read of the same object.
    pub read_handle: Option<Vec<u8>>,
}

/// Parameters for a fresh resumable upload.
#[derive(Debug, Clone)]
pub struct ResumableWriteRequest {
    /// Object name.
    pub name: String,
    /// Require this generation at finalize, if set.
    pub generation_precondition: Option<i64>,
    /// Chunk size the writer transfers per request.
    pub chunk_size: usize,
    /// Per-chunk transfer timeout.
    pub chunk_transfer_timeout: Duration,
    /// Total retry deadline for a chunk.
    pub retry_deadline: Duration,
}

/// Parameters for continuing an unfinalized appendable object.
#[derive(Debug, Clone)]
pub struct AppendableWriteRequest {
    /// Object name.
    pub name: String,
    /// Offset at which appending resumes; must equal the current size.
    pub start_offset: u64,
    /// Chunk size the writer transfers per request.
    pub chunk_size: usize,
}

/// Summary of a stored object returned by flush and finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStub {
    /// Object name.
    pub name: String,
    /// Size in bytes visible at the store.
    pub size: u64,
    /// Generation assigned by the store.
    pub generation: i64,
    /// Modification time, when the store reports one.
    pub mtime: Option<DateTime<Utc>>,
}

/// Streaming source for one ranged download.
#[async_trait]
pub trait ObjectReader: Send {
    /// Read some bytes into `buf`. `Ok(0)` means the range is exhausted.
    async fn read(&mut self, buf: &mut [u8]) -> StoreResult<usize>;
}

/// Streaming sink for one resumable or appendable upload.
#[async_trait]
pub trait ObjectWriter: Send {
    /// Append `data` to the upload, in order.
    async fn write_all(&mut self, data: &[u8]) -> StoreResult<()>;

    /// Make the bytes written so far queryable without finalizing.
    /// Zonal-style buckets only.
    async fn flush_pending(&mut self) -> StoreResult<ObjectStub>;

    /// Complete the upload, making the object visible at its final size.
    async fn finalize(&mut self) -> StoreResult<ObjectStub>;
}

/// Factory surface of the object-store client.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Which bucket flavor this store talks to.
    fn bucket_kind(&self) -> BucketKind;

    /// Open a ranged reader for one object generation.
    async fn new_range_reader(&self, req: RangeRequest) -> StoreResult<Box<dyn ObjectReader>>;

    /// Start a fresh resumable upload.
    async fn new_resumable_writer(
        &self,
        req: ResumableWriteRequest,
    ) -> StoreResult<Box<dyn ObjectWriter>>;

    /// Reopen an unfinalized appendable object at its current size.
    async fn new_appendable_writer(
        &self,
        req: AppendableWriteRequest,
    ) -> StoreResult<Box<dyn ObjectWriter>>;
}
