//! In-memory object store.
//!
//! Deterministic stand-in for the real store client, always compiled so
//! unit tests, integration tests, and examples share one double. Supports
//! the full trait surface plus a small fault script: failing the next
//! range-reader open, failing the nth writer chunk, throttling reader
//! chunk sizes, and delaying reads. Every ranged read is logged so tests
//! can assert how many fetches a scenario issued and at which offsets.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;

use super::{
    AppendableWriteRequest, BucketKind, ObjectMeta, ObjectReader, ObjectStore, ObjectStub,
    ObjectWriter, RangeRequest, ResumableWriteRequest, StoreError, StoreResult,
};

/// One stored object.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Object content.
    pub data: Vec<u8>,
    /// Generation assigned at the last publish.
    pub generation: i64,
    /// False while the object is an unfinalized appendable.
    pub finalized: bool,
}

/// Scripted failures, applied once each unless noted.
#[derive(Debug, Default)]
pub struct FaultPlan {
    /// Fail the next `new_range_reader` call with this error.
    pub fail_next_range_reader: Option<StoreError>,
    /// Fail the nth `write_all` call (1-based, counted per writer).
    pub fail_writer_write: Option<(usize, StoreError)>,
    /// Serve at most this many bytes per reader `read` call. Persistent.
    pub read_chunk_limit: Option<usize>,
    /// Sleep this long before every reader `read` call. Persistent.
    pub read_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct MemState {
    objects: HashMap<String, StoredObject>,
    next_generation: i64,
    range_reads: Vec<(String, Range<u64>)>,
    faults: FaultPlan,
}

/// In-memory [`ObjectStore`] implementation.
pub struct InMemoryStore {
    kind: BucketKind,
    state: Arc<Mutex<MemState>>,
}

impl InMemoryStore {
    /// Empty store backing the given bucket flavor.
    #[must_use]
    pub fn new(kind: BucketKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(MemState::default())),
        }
    }

    /// Insert a finalized object and return the handle metadata a FUSE
    /// open would produce for it.
    pub fn put_object(&self, name: &str, data: &[u8]) -> ObjectMeta {
        let mut state = self.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        state.objects.insert(
            name.to_owned(),
            StoredObject {
                data: data.to_vec(),
                generation,
                finalized: true,
            },
        );
        ObjectMeta {
            name: name.to_owned(),
            generation,
            size: data.len() as u64,
        }
    }

    /// Remove an object, as an external writer clobbering it would.
    pub fn delete_object(&self, name: &str) {
        self.state.lock().objects.remove(name);
    }

    /// Current content of an object, if present.
    #[must_use]
    pub fn object(&self, name: &str) -> Option<StoredObject> {
        self.state.lock().objects.get(name).cloned()
    }

    /// Every ranged read issued so far, in order.
    #[must_use]
    pub fn range_reads(&self) -> Vec<(String, Range<u64>)> {
        self.state.lock().range_reads.clone()
    }

    /// Replace the fault script.
    pub fn set_faults(&self, faults: FaultPlan) {
        self.state.lock().faults = faults;
    }

    /// Fail the next range-reader open with `err`.
    pub fn fail_next_range_reader(&self, err: StoreError) {
        self.state.lock().faults.fail_next_range_reader = Some(err);
    }

    /// Fail the nth `write_all` (1-based, per writer) with `err`.
    pub fn fail_writer_write(&self, nth: usize, err: StoreError) {
        self.state.lock().faults.fail_writer_write = Some((nth, err));
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    fn bucket_kind(&self) -> BucketKind {
        self.kind
    }

    async fn new_range_reader(&self, req: RangeRequest) -> StoreResult<Box<dyn ObjectReader>> {
        let mut state = self.state.lock();
        if let Some(err) = state.faults.fail_next_range_reader.take() {
            return Err(err);
        }
        let Some(object) = state.objects.get(&req.name) else {
            return Err(StoreError::NotFound(req.name));
        };
        if req.generation != 0 && req.generation != object.generation {
            // The pinned generation is gone; the live object is a stranger.
            return Err(StoreError::NotFound(req.name));
        }
        let end = (req.range.end as usize).min(object.data.len());
        let start = (req.range.start as usize).min(end);
        let data = Bytes::copy_from_slice(&object.data[start..end]);
        state.range_reads.push((req.name, req.range));
        Ok(Box::new(MemRangeReader {
            data,
            pos: 0,
            chunk_limit: state.faults.read_chunk_limit,
            delay: state.faults.read_delay,
        }))
    }

    async fn new_resumable_writer(
        &self,
        req: ResumableWriteRequest,
    ) -> StoreResult<Box<dyn ObjectWriter>> {
        if let Some(generation) = req.generation_precondition {
            let state = self.state.lock();
            let current = state.objects.get(&req.name).map(|o| o.generation).unwrap_or(0);
            if generation != 0 && generation != current {
                return Err(StoreError::PreconditionFailed(req.name));
            }
        }
        Ok(Box::new(MemObjectWriter {
            name: req.name,
            state: Arc::clone(&self.state),
            content: Vec::new(),
            writes: 0,
        }))
    }

    async fn new_appendable_writer(
        &self,
        req: AppendableWriteRequest,
    ) -> StoreResult<Box<dyn ObjectWriter>> {
        let state = self.state.lock();
        let content = match state.objects.get(&req.name) {
            Some(object) => {
                let keep = (req.start_offset as usize).min(object.data.len());
                object.data[..keep].to_vec()
            }
            // Appending to a not-yet-published object starts empty.
            None => Vec::new(),
        };
        drop(state);
        Ok(Box::new(MemObjectWriter {
            name: req.name,
            state: Arc::clone(&self.state),
            content,
            writes: 0,
        }))
    }
}

struct MemRangeReader {
    data: Bytes,
    pos: usize,
    chunk_limit: Option<usize>,
    delay: Option<Duration>,
}

#[async_trait]
impl ObjectReader for MemRangeReader {
    async fn read(&mut self, buf: &mut [u8]) -> StoreResult<usize> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut n = buf.len().min(self.data.len() - self.pos);
        if let Some(limit) = self.chunk_limit {
            n = n.min(limit);
        }
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct MemObjectWriter {
    name: String,
    state: Arc<Mutex<MemState>>,
    content: Vec<u8>,
    writes: usize,
}

impl MemObjectWriter {
    /// Publish the buffered content, bumping the generation only when
    /// finalizing.
    fn publish(&self, finalized: bool) -> ObjectStub {
        let mut state = self.state.lock();
        let generation = if finalized {
            state.next_generation += 1;
            state.next_generation
        } else {
            state
                .objects
                .get(&self.name)
                .map_or(0, |o| o.generation)
        };
        state.objects.insert(
            self.name.clone(),
            StoredObject {
                data: self.content.clone(),
                generation,
                finalized,
            },
        );
        ObjectStub {
            name: self.name.clone(),
            size: self.content.len() as u64,
            generation,
            mtime: Some(Utc::now()),
        }
    }
}

#[async_trait]
impl ObjectWriter for MemObjectWriter {
    async fn write_all(&mut self, data: &[u8]) -> StoreResult<()> {
        self.writes += 1;
        let fault = {
            let mut state = self.state.lock();
            match state.faults.fail_writer_write {
                Some((nth, ref err)) if nth == self.writes => {
                    let err = err.clone();
                    state.faults.fail_writer_write = None;
                    Some(err)
                }
                _ => None,
            }
        };
        if let Some(err) = fault {
            return Err(err);
        }
        self.content.extend_from_slice(data);
        Ok(())
    }

    async fn flush_pending(&mut self) -> StoreResult<ObjectStub> {
        Ok(self.publish(false))
    }

    async fn finalize(&mut self) -> StoreResult<ObjectStub> {
        Ok(self.publish(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn range_reader_serves_requested_window() {
        let store = InMemoryStore::new(BucketKind::Standard);
        let meta = store.put_object("obj", b"0123456789");

        let mut reader = store
            .new_range_reader(RangeRequest {
                name: meta.name.clone(),
                generation: meta.generation,
                range: 2..6,
                read_compressed: false,
                read_handle: None,
            })
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"2345");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(store.range_reads(), vec![("obj".to_owned(), 2..6)]);
    }

    #[tokio::test]
    async fn stale_generation_reads_not_found() {
        let store = InMemoryStore::new(BucketKind::Standard);
        let meta = store.put_object("obj", b"old");
        store.put_object("obj", b"new contents");

        let result = store
            .new_range_reader(RangeRequest {
                name: meta.name.clone(),
                generation: meta.generation,
                range: 0..3,
                read_compressed: false,
                read_handle: None,
            })
            .await;
        let err = match result {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err, StoreError::NotFound("obj".to_owned()));
    }

    #[tokio::test]
    async fn resumable_writer_publishes_only_on_finalize() {
        let store = InMemoryStore::new(BucketKind::Standard);
        let mut writer = store
            .new_resumable_writer(ResumableWriteRequest {
                name: "fresh".to_owned(),
                generation_precondition: None,
                chunk_size: 4,
                chunk_transfer_timeout: Duration::from_secs(1),
                retry_deadline: Duration::from_secs(1),
            })
            .await
            .unwrap();

        writer.write_all(b"hello ").await.unwrap();
        writer.write_all(b"world").await.unwrap();
        assert!(store.object("fresh").is_none());

        let stub = writer.finalize().await.unwrap();
        assert_eq!(stub.size, 11);
        let object = store.object("fresh").unwrap();
        assert_eq!(object.data, b"hello world");
        assert!(object.finalized);
    }

    #[tokio::test]
    async fn appendable_writer_resumes_existing_bytes() {
        let store = InMemoryStore::new(BucketKind::Zonal);
        store.put_object("log", b"part-1;");

        let mut writer = store
            .new_appendable_writer(AppendableWriteRequest {
                name: "log".to_owned(),
                start_offset: 7,
                chunk_size: 4,
            })
            .await
            .unwrap();
        writer.write_all(b"part-2;").await.unwrap();

        let stub = writer.flush_pending().await.unwrap();
        assert_eq!(stub.size, 14);
        let object = store.object("log").unwrap();
        assert_eq!(object.data, b"part-1;part-2;");
        assert!(!object.finalized);
    }

    #[tokio::test]
    async fn writer_fault_fires_on_requested_chunk() {
        let store = InMemoryStore::new(BucketKind::Standard);
        store.fail_writer_write(2, StoreError::Transport("chunk lost".into()));

        let mut writer = store
            .new_resumable_writer(ResumableWriteRequest {
                name: "x".to_owned(),
                generation_precondition: None,
                chunk_size: 4,
                chunk_transfer_timeout: Duration::from_secs(1),
                retry_deadline: Duration::from_secs(1),
            })
            .await
            .unwrap();
        writer.write_all(b"a").await.unwrap();
        let err = writer.write_all(b"b").await.unwrap_err();
        assert_eq!(err, StoreError::Transport("chunk lost".into()));
        // The fault is one-shot.
        writer.write_all(b"c").await.unwrap();
    }
}
