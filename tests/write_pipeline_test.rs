//! Integration tests for the streaming write path.
//!
//! Drives `BufferedWriter` end-to-end against the in-memory store:
//! ordering rules, truncation padding, latched upload failures, zonal
//! flush visibility, and the write-then-read round trip through the
//! prefetching reader.

use std::sync::Arc;

use blobfs::store::mem::InMemoryStore;
use blobfs::store::{BucketKind, ObjectMeta, ObjectStore, StoreError};
use blobfs::{
    BufferedReader, BufferedWriter, ReadError, TransferConfig, TransferContext, WriteError,
};
use rand::RngCore;
use tokio_test::assert_ok;

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

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn new_object(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: name.to_owned(),
        generation: 0,
        size: 0,
    }
}

fn init_tracing() {
    // try_init: later calls in the same process are no-ops.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn open_writer(
    store: &Arc<InMemoryStore>,
    object: ObjectMeta,
    ctx: &TransferContext,
    cfg: &TransferConfig,
) -> BufferedWriter {
    init_tracing();
    BufferedWriter::new(
        object,
        Arc::clone(store) as Arc<dyn ObjectStore>,
        ctx,
        cfg,
    )
    .expect("writer construction")
}

#[tokio::test]
async fn out_of_order_write_rejected_and_state_unchanged() {
    let ctx = TransferContext::new(1, 32);
    let store = Arc::new(InMemoryStore::new(BucketKind::Standard));
    let mut writer = open_writer(&store, new_object("ord"), &ctx, &config());

    writer.write(b"hello", 0).await.unwrap();
    writer.write(b"x", 5).await.unwrap();
    assert_eq!(
        writer.write(b"y", 4).await.unwrap_err(),
        WriteError::OutOfOrderWrite { offset: 4, size: 6 }
    );
    assert_eq!(writer.total_size(), 6);

    // The finalized object holds only the accepted writes.
    let stub = writer.flush().await.unwrap();
    assert_eq!(stub.size, 6);
    assert_eq!(store.object("ord").unwrap().data, b"hellox");
}

#[tokio::test]
async fn truncate_then_write_produces_zero_padded_object() {
    let ctx = TransferContext::new(1, 32);
    let store = Arc::new(InMemoryStore::new(BucketKind::Standard));
    let mut writer = open_writer(&store, new_object("pad"), &ctx, &config());

    writer.truncate(2).unwrap();
    writer.write(b"hello", 2).await.unwrap();
    assert_eq!(writer.write_file_info().total_size, 7);

    let stub = writer.flush().await.unwrap();
    assert_eq!(stub.size, 7);
    assert_eq!(store.object("pad").unwrap().data, b"\0\0hello");
}

#[tokio::test]
async fn large_truncation_pads_in_bounded_chunks() {
    let ctx = TransferContext::new(1, 32);
    let store = Arc::new(InMemoryStore::new(BucketKind::Standard));
    let mut writer = open_writer(&store, new_object("gap"), &ctx, &config());

    // A gap far larger than one block; padding flows through the normal
    // append path block by block.
    let target = 5 * B + 3;
    writer.truncate(target).unwrap();
    writer.write(b"end", target).await.unwrap();

    let stub = writer.flush().await.unwrap();
    assert_eq!(stub.size, target + 3);
    let data = store.object("gap").unwrap().data;
    assert!(data[..target as usize].iter().all(|&b| b == 0));
    assert_eq!(&data[target as usize..], b"end");
}

#[tokio::test]
async fn upload_failure_latches_and_leaves_no_partial_object() {
    let ctx = TransferContext::new(1, 32);
    let store = Arc::new(InMemoryStore::new(BucketKind::Standard));
    let mut writer = open_writer(&store, new_object("fail"), &ctx, &config());
    store.fail_writer_write(2, StoreError::Transport("chunk lost".into()));

    let chunk = vec![9u8; B as usize];
    for i in 0..4u64 {
        writer.write(&chunk, i * B).await.unwrap();
    }
    // The fifth block may already observe the latch.
    let _ = writer.write(&chunk, 4 * B).await;
    writer.sync().await.unwrap_err();

    let expected = WriteError::Upload(StoreError::Transport("chunk lost".into()));
    assert_eq!(
        writer
            .write(b"more", writer.total_size())
            .await
            .unwrap_err(),
        expected
    );
    assert_eq!(writer.flush().await.unwrap_err(), expected);

    writer.destroy().await;
    assert!(store.object("fail").is_none());
}

#[tokio::test]
async fn write_flush_read_round_trip() -> anyhow::Result<()> {
    let ctx = TransferContext::new(2, 64);
    let store = Arc::new(InMemoryStore::new(BucketKind::Standard));
    let data = random_bytes((7 * B + 123) as usize);

    let mut writer = open_writer(&store, new_object("file"), &ctx, &config());
    // Feed the writer in uneven slices, strictly in order.
    let mut off = 0usize;
    for chunk in data.chunks(700) {
        writer.write(chunk, off as u64).await?;
        off += chunk.len();
    }
    let stub = writer.flush().await?;
    assert_eq!(stub.size, data.len() as u64);

    let mut reader = BufferedReader::new(
        ObjectMeta {
            name: stub.name.clone(),
            generation: stub.generation,
            size: stub.size,
        },
        Arc::clone(&store) as Arc<dyn ObjectStore>,
        &ctx,
        &config(),
    )?;

    let mut got = Vec::new();
    let mut off = 0u64;
    while off < stub.size {
        let resp = reader.read_at(B as usize, off).await?;
        off += resp.size() as u64;
        got.extend_from_slice(&resp.to_vec());
    }
    assert_eq!(got, data);

    assert_eq!(reader.read_at(1, stub.size).await.unwrap_err(), ReadError::Eof);
    reader.destroy().await;
    Ok(())
}

#[tokio::test]
async fn zonal_sync_is_queryable_before_finalize() {
    let ctx = TransferContext::new(1, 32);
    let store = Arc::new(InMemoryStore::new(BucketKind::Zonal));
    let mut writer = open_writer(&store, new_object("zone"), &ctx, &config());

    let data = random_bytes((B + 17) as usize);
    writer.write(&data, 0).await.unwrap();
    let stub = assert_ok!(writer.sync().await).expect("zonal sync stub");
    assert_eq!(stub.size, data.len() as u64);

    let visible = store.object("zone").unwrap();
    assert_eq!(visible.data, data);
    assert!(!visible.finalized);

    let stub = writer.flush().await.unwrap();
    assert_eq!(stub.size, data.len() as u64);
    assert!(store.object("zone").unwrap().finalized);
}

#[tokio::test]
async fn zonal_append_continues_an_unfinalized_object() -> anyhow::Result<()> {
    let ctx = TransferContext::new(1, 32);
    let store = Arc::new(InMemoryStore::new(BucketKind::Zonal));

    // First handle writes and syncs without finalizing.
    let mut first = open_writer(&store, new_object("appendable"), &ctx, &config());
    first.write(b"first part;", 0).await?;
    first.sync().await?;
    first.destroy().await;

    // Second handle opens the unfinalized object and appends.
    let existing = store.object("appendable").unwrap();
    assert!(!existing.finalized);
    let mut second = open_writer(
        &store,
        ObjectMeta {
            name: "appendable".to_owned(),
            generation: existing.generation,
            size: existing.data.len() as u64,
        },
        &ctx,
        &config(),
    );
    second
        .write(b"second part", existing.data.len() as u64)
        .await?;
    let stub = second.flush().await?;

    assert_eq!(stub.size, 22);
    assert_eq!(store.object("appendable").unwrap().data, b"first part;second part");
    Ok(())
}

#[tokio::test]
async fn unlink_aborts_silently_and_keeps_the_handle_usable() {
    let ctx = TransferContext::new(1, 32);
    let store = Arc::new(InMemoryStore::new(BucketKind::Standard));
    let mut writer = open_writer(&store, new_object("gone"), &ctx, &config());

    writer.write(&random_bytes(3 * B as usize), 0).await.unwrap();
    writer.unlink().await;

    // The handle is still open; writes keep succeeding and are forgotten.
    writer
        .write(b"shout into the void", writer.total_size())
        .await
        .unwrap();
    writer.destroy().await;
    assert!(store.object("gone").is_none());
}

#[tokio::test]
async fn mtime_is_reported_through_write_file_info() {
    let ctx = TransferContext::new(1, 32);
    let store = Arc::new(InMemoryStore::new(BucketKind::Standard));
    let mut writer = open_writer(&store, new_object("stamped"), &ctx, &config());

    assert_eq!(writer.write_file_info().mtime, None);
    let stamp = chrono::Utc::now();
    writer.set_mtime(stamp);
    writer.write(b"data", 0).await.unwrap();

    let info = writer.write_file_info();
    assert_eq!(info.mtime, Some(stamp));
    assert_eq!(info.total_size, 4);
    writer.flush().await.unwrap();
}
