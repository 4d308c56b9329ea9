//! Transfer counters.
//!
//! One [`TransferMetrics`] instance is shared by every handle of a mount.
//! The counters are plain relaxed atomics; an exporter layer, if any, sits
//! outside this crate and reads [`TransferMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide transfer counters.
#[derive(Debug, Default)]
pub struct TransferMetrics {
    bytes_downloaded: AtomicU64,
    bytes_uploaded: AtomicU64,
    blocks_evicted: AtomicU64,
    reader_fallbacks: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Bytes fetched from the object store, including partial downloads.
    pub bytes_downloaded: u64,
    /// Bytes copied into store writers.
    pub bytes_uploaded: u64,
    /// Prefetched blocks discarded before consumption.
    pub blocks_evicted: u64,
    /// Readers that gave up and told the caller to fall back.
    pub reader_fallbacks: u64,
}

impl TransferMetrics {
    /// Fresh zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_download(&self, bytes: usize) {
        self.bytes_downloaded
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_upload(&self, bytes: usize) {
        self.bytes_uploaded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self) {
        self.blocks_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback(&self) {
        self.reader_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters at once.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            blocks_evicted: self.blocks_evicted.load(Ordering::Relaxed),
            reader_fallbacks: self.reader_fallbacks.load(Ordering::Relaxed),
        }
    }
}
