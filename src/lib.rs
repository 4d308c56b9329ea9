//! # blobfs transfer core
//!
//! This crate is the transfer core of a FUSE-backed object-storage client:
//! the per-file read prefetcher and the per-file streaming uploader. It
//! sits between a kernel file-system driver — which delivers byte-range
//! read/write calls against large remote objects — and an object store
//! speaking a resumable multi-part protocol. Sequential reads are turned
//! into pipelined ranged downloads so workloads see memory-speed latency;
//! writes stream to the service in order instead of landing in local temp
//! files.
//!
//! ## Crate structure
//!
//! - **`config`**: strongly-typed knobs loaded via figment from TOML and
//!   environment, with semantic validation.
//! - **`context`**: the per-mount shared state — worker pool, global block
//!   budget, transfer counters.
//! - **`error`**: `ReadError` / `WriteError`, the entry-point error
//!   surface.
//! - **`metrics`**: atomic transfer counters shared across handles.
//! - **`read`**: the prefetch pipeline — blocks, download tasks, the
//!   in-flight queue, and the `BufferedReader` front door.
//! - **`store`**: the outbound object-store traits the core consumes,
//!   plus an always-available in-memory implementation for tests.
//! - **`workers`**: the two-priority worker pool download tasks run on.
//! - **`write`**: the upload pipeline — write blocks, the single-worker
//!   uploader, and the `BufferedWriter` front door.
//!
//! The block pool itself lives in the `blobfs-pool` crate, re-exported
//! here as [`pool`].
//!
//! ## Ownership model
//!
//! Buffers are loaned from per-handle pools that draw on one process-wide
//! budget. On the read side the kernel borrows downloaded bytes as
//! reference-counted slices, so a block can leave the prefetch queue while
//! its bytes are still on loan; memory returns to the pool only when the
//! last borrower is done. On the write side blocks move by value through
//! the upload channel and return to the pool as the uploader finishes with
//! them.

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod read;
pub mod store;
pub mod workers;
pub mod write;

pub use blobfs_pool as pool;

pub use config::{ConfigError, TransferConfig};
pub use context::TransferContext;
pub use error::{ReadError, WriteError};
pub use metrics::{MetricsSnapshot, TransferMetrics};
pub use read::{BlockSlice, BufferedReader, ReadResponse};
pub use write::{BufferedWriter, WriteFileInfo};
