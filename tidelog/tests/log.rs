// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end behavior of the log façade.
use std::time::Duration;

use tokio::time::timeout;

use tidelog::{
    CacheOption, EncryptionKey, Event, EventStream, GetOptions, KeyPair, Log, LogError,
    MemoryStorage, Options, RangeOptions, SessionOptions,
};

async fn next_event(stream: &mut EventStream) -> Event {
    timeout(Duration::from_secs(5), stream.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream ended")
}

async fn writable_log() -> Log {
    Log::open(MemoryStorage::new(), Options::new().key_pair(KeyPair::generate()))
        .await
        .expect("open writable log")
}

fn random_blocks(count: usize, size: usize) -> Vec<Vec<u8>> {
    use rand::RngCore;
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let mut block = vec![0u8; size];
            rng.fill_bytes(&mut block);
            block
        })
        .collect()
}

#[tokio::test]
async fn append_read_round_trip() {
    let log = writable_log().await;
    let outcome = log
        .append(vec![b"hello".to_vec(), b"world".to_vec()])
        .await
        .unwrap();
    assert_eq!(outcome.length, 2);
    assert_eq!(outcome.byte_length, 10);
    assert_eq!(log.length(), 2);
    assert_eq!(log.byte_length(), 10);
    assert_eq!(log.get(0).await.unwrap().unwrap(), b"hello");
    assert_eq!(log.get(1).await.unwrap().unwrap(), b"world");
    log.close().await.unwrap();
}

#[tokio::test]
async fn get_resolves_identically_with_and_without_cache() {
    let log = Log::open(
        MemoryStorage::new(),
        Options::new()
            .key_pair(KeyPair::generate())
            .cache(CacheOption::Default),
    )
    .await
    .unwrap();
    log.append_one(b"stable".to_vec()).await.unwrap();
    let first = log.get(0).await.unwrap().unwrap();
    // Second read is served from the cache.
    let second = log.get(0).await.unwrap().unwrap();
    assert_eq!(first, second);
    log.close().await.unwrap();
}

#[tokio::test]
async fn wait_false_returns_null_without_contacting_peers() {
    let log = writable_log().await;
    log.append_one(b"only".to_vec()).await.unwrap();
    assert_eq!(
        log.get_with(5, GetOptions::no_wait()).await.unwrap(),
        None
    );
    log.close().await.unwrap();
}

#[tokio::test]
async fn empty_append_is_a_no_op() {
    let log = writable_log().await;
    log.append_one(b"x".to_vec()).await.unwrap();
    let outcome = log.append(Vec::new()).await.unwrap();
    assert_eq!(outcome.length, 1);
    assert_eq!(outcome.byte_length, 1);
    log.close().await.unwrap();
}

#[tokio::test]
async fn read_only_log_is_not_writable() {
    let writer = writable_log().await;
    let reader = Log::open(MemoryStorage::new(), Options::new().key(&writer.key()))
        .await
        .unwrap();
    assert!(writer.writable());
    assert!(!reader.writable());
    assert!(matches!(
        reader.append_one(b"nope".to_vec()).await,
        Err(LogError::NotWritable)
    ));
    reader.close().await.unwrap();
    writer.close().await.unwrap();
}

#[tokio::test]
async fn wrong_sized_key_fails_to_open() {
    let result = Log::open(MemoryStorage::new(), Options::new().key("ff00ff00")).await;
    assert!(matches!(result, Err(LogError::InvalidKey)));
}

#[tokio::test]
async fn replication_fill() {
    let writer = writable_log().await;
    let blocks = random_blocks(100, 64);
    writer.append(blocks.clone()).await.unwrap();

    let reader = Log::open(MemoryStorage::new(), Options::new().key(&writer.key()))
        .await
        .unwrap();
    let mut reader_events = reader.subscribe();

    let (left, right) = tokio::io::duplex(1 << 16);
    let _writer_stream = writer.replicate_io(true, left).await.unwrap();
    let _reader_stream = reader.replicate_io(false, right).await.unwrap();

    let range = reader
        .download(RangeOptions {
            start: 0,
            end: Some(100),
            ..RangeOptions::default()
        })
        .unwrap();
    range.done().await.unwrap();

    // Every transferred block surfaced as a download event.
    let mut downloaded = 0u64;
    while downloaded < 100 {
        if let Event::Download { from, .. } = next_event(&mut reader_events).await {
            assert!(from.is_some());
            downloaded += 1;
        }
    }

    for (index, expected) in blocks.iter().enumerate() {
        let block = reader.get(index as u64).await.unwrap().unwrap();
        assert_eq!(&block, expected, "block {index} differs");
    }
    assert_eq!(
        reader.tree_hash(Some(100)).unwrap(),
        writer.tree_hash(Some(100)).unwrap()
    );

    reader.close().await.unwrap();
    writer.close().await.unwrap();
}

#[tokio::test]
async fn snapshot_isolation() {
    let log = writable_log().await;
    log.append(vec![b"a".to_vec(), b"b".to_vec()]).await.unwrap();

    let snapshot = log.snapshot().unwrap();
    log.append_one(b"c".to_vec()).await.unwrap();

    assert_eq!(snapshot.length(), 2);
    assert_eq!(snapshot.byte_length(), 2);
    assert_eq!(log.length(), 3);
    // The pin bounds reads: beyond the snapshot length there is nothing.
    assert_eq!(snapshot.get(2).await.unwrap(), None);
    assert!(!snapshot.has(2));
    assert_eq!(snapshot.get(1).await.unwrap().unwrap(), b"b");

    // The pin survives truncation too.
    log.truncate(1, None).await.unwrap();
    assert_eq!(snapshot.length(), 2);
    assert_eq!(snapshot.fork(), 0);
    assert_eq!(log.fork(), 1);

    snapshot.close().await.unwrap();
    log.close().await.unwrap();
}

#[tokio::test]
async fn truncate_fork() {
    let log = Log::open(
        MemoryStorage::new(),
        Options::new()
            .key_pair(KeyPair::generate())
            .cache(CacheOption::Default),
    )
    .await
    .unwrap();
    let mut events = log.subscribe();

    log.append((0..5u8).map(|i| vec![i; 4]).collect()).await.unwrap();
    // Warm the cache.
    log.get(0).await.unwrap();

    log.truncate(3, None).await.unwrap();
    assert_eq!(log.length(), 3);
    assert_eq!(log.fork(), 1);
    assert!(!log.has(3));
    assert_eq!(log.get_with(3, GetOptions::no_wait()).await.unwrap(), None);
    assert_eq!(log.get_with(4, GetOptions::no_wait()).await.unwrap(), None);
    // Surviving blocks still read correctly after the cache was cleared.
    assert_eq!(log.get(0).await.unwrap().unwrap(), vec![0u8; 4]);

    // Events: appends first, then the truncation with its fork.
    loop {
        match next_event(&mut events).await {
            Event::Truncate { start, fork } => {
                assert_eq!((start, fork), (3, 1));
                break;
            }
            _ => continue,
        }
    }
    log.close().await.unwrap();
}

#[tokio::test]
async fn truncate_to_current_length_still_bumps_fork() {
    let log = writable_log().await;
    log.append(vec![b"a".to_vec(), b"b".to_vec()]).await.unwrap();
    log.truncate(2, None).await.unwrap();
    assert_eq!(log.length(), 2);
    assert_eq!(log.fork(), 1);
    log.close().await.unwrap();
}

#[tokio::test]
async fn encryption_transparency() {
    let encryption_key = EncryptionKey::random();
    let writer = Log::open(
        MemoryStorage::new(),
        Options::new()
            .key_pair(KeyPair::generate())
            .encryption_key(encryption_key.clone()),
    )
    .await
    .unwrap();
    writer.append_one(b"secret".to_vec()).await.unwrap();
    assert_eq!(writer.byte_length(), 6);
    assert_eq!(writer.padding(), 8);

    let reader_storage = MemoryStorage::new();
    let reader = Log::open(
        reader_storage.clone(),
        Options::new()
            .key(&writer.key())
            .encryption_key(encryption_key),
    )
    .await
    .unwrap();

    let (left, right) = tokio::io::duplex(1 << 16);
    writer.replicate_io(true, left).await.unwrap();
    reader.replicate_io(false, right).await.unwrap();

    assert_eq!(reader.get(0).await.unwrap().unwrap(), b"secret");
    reader.close().await.unwrap();
    writer.close().await.unwrap();

    // The stored bytes on the reader are ciphertext, not the plaintext.
    let raw = Log::open(reader_storage, Options::new()).await.unwrap();
    let stored = raw.get(0).await.unwrap().unwrap();
    assert_eq!(stored.len(), 6 + 8);
    assert_ne!(&stored[8..], b"secret");
    raw.close().await.unwrap();
}

#[tokio::test]
async fn session_close_semantics() {
    let root = writable_log().await;
    let second = root.session(SessionOptions::new()).unwrap();
    let third = root.session(SessionOptions::new()).unwrap();

    let mut root_events = root.subscribe();
    let mut second_events = second.subscribe();
    let mut third_events = third.subscribe();

    // Close in arbitrary order: root first, last one shuts the engine.
    root.close().await.unwrap();
    assert_eq!(next_event(&mut root_events).await, Event::Close { is_last: false });

    second.close().await.unwrap();
    assert_eq!(next_event(&mut second_events).await, Event::Close { is_last: false });

    third.close().await.unwrap();
    assert_eq!(next_event(&mut third_events).await, Event::Close { is_last: true });

    // Closing again is idempotent and emits nothing further.
    third.close().await.unwrap();
    assert!(matches!(third.append_one(b"x".to_vec()).await, Err(LogError::Closed)));
}

#[tokio::test]
async fn closing_log_rejects_new_sessions() {
    let root = writable_log().await;
    root.close().await.unwrap();
    assert!(matches!(
        root.session(SessionOptions::new()),
        Err(LogError::SessionClosing)
    ));
}

#[tokio::test]
async fn auto_close_shuts_the_remaining_session() {
    let root = Log::open(
        MemoryStorage::new(),
        Options::new().key_pair(KeyPair::generate()).auto_close(true),
    )
    .await
    .unwrap();
    let mut root_events = root.subscribe();
    let session = root.session(SessionOptions::new()).unwrap();

    session.close().await.unwrap();
    assert_eq!(next_event(&mut root_events).await, Event::Close { is_last: true });
    assert!(matches!(root.append_one(b"x".to_vec()).await, Err(LogError::Closed)));
}

#[tokio::test]
async fn dir_storage_persists_across_reopen() {
    use tidelog::DirStorage;

    let dir = tempfile::tempdir().unwrap();
    let key_pair = KeyPair::generate();
    {
        let log = Log::open(
            DirStorage::new(dir.path()),
            Options::new().key_pair(key_pair.clone()),
        )
        .await
        .unwrap();
        log.append(vec![b"durable".to_vec(), b"bytes".to_vec()])
            .await
            .unwrap();
        log.close().await.unwrap();
    }

    let log = Log::open(DirStorage::new(dir.path()), Options::new())
        .await
        .unwrap();
    assert_eq!(log.length(), 2);
    assert_eq!(log.key(), key_pair.public);
    assert_eq!(log.get(0).await.unwrap().unwrap(), b"durable");
    // Secret material persisted with the header keeps the log writable.
    assert!(log.writable());
    log.close().await.unwrap();
}

#[tokio::test]
async fn update_without_peers_is_false() {
    let log = writable_log().await;
    assert!(!log.update().await.unwrap());
    log.close().await.unwrap();
}

#[tokio::test]
async fn update_pulls_the_remote_head() {
    let writer = writable_log().await;
    writer.append(vec![b"a".to_vec(), b"b".to_vec()]).await.unwrap();

    let reader = Log::open(MemoryStorage::new(), Options::new().key(&writer.key()))
        .await
        .unwrap();
    let (left, right) = tokio::io::duplex(1 << 16);
    writer.replicate_io(true, left).await.unwrap();
    reader.replicate_io(false, right).await.unwrap();

    // The head may already have arrived with the handshake, in which case
    // the probe finds nothing newer; either way the length advances.
    reader.update().await.unwrap();
    assert_eq!(reader.length(), 2);

    reader.close().await.unwrap();
    writer.close().await.unwrap();
}

#[tokio::test]
async fn seek_resolves_locally_and_remotely() {
    let writer = writable_log().await;
    writer
        .append(vec![b"aa".to_vec(), b"bbb".to_vec(), b"c".to_vec()])
        .await
        .unwrap();
    assert_eq!(writer.seek(0).await.unwrap(), (0, 0));
    assert_eq!(writer.seek(3).await.unwrap(), (1, 1));
    assert_eq!(writer.seek(5).await.unwrap(), (2, 0));

    let reader = Log::open(MemoryStorage::new(), Options::new().key(&writer.key()))
        .await
        .unwrap();
    let (left, right) = tokio::io::duplex(1 << 16);
    writer.replicate_io(true, left).await.unwrap();
    reader.replicate_io(false, right).await.unwrap();
    reader.update().await.unwrap();

    // The reader has no leaf nodes below its adopted roots; the seek is
    // answered by the writer.
    assert_eq!(reader.seek(3).await.unwrap(), (1, 1));

    reader.close().await.unwrap();
    writer.close().await.unwrap();
}

#[tokio::test]
async fn user_data_round_trip() {
    let storage = MemoryStorage::new();
    let key_pair = KeyPair::generate();
    let log = Log::open(
        storage.clone(),
        Options::new()
            .key_pair(key_pair.clone())
            .user_data("name", b"tide".to_vec()),
    )
    .await
    .unwrap();
    assert_eq!(log.get_user_data("name").unwrap(), b"tide");
    log.set_user_data("name", Some(b"log".to_vec())).await.unwrap();
    log.set_user_data("other", Some(b"value".to_vec())).await.unwrap();
    log.close().await.unwrap();

    // Persisted across reopen.
    let log = Log::open(storage, Options::new().key_pair(key_pair)).await.unwrap();
    assert_eq!(log.get_user_data("name").unwrap(), b"log");
    assert_eq!(log.get_user_data("other").unwrap(), b"value");
    log.close().await.unwrap();
}

#[tokio::test]
async fn tree_hash_is_deterministic() {
    let key_pair = KeyPair::generate();
    let a = Log::open(MemoryStorage::new(), Options::new().key_pair(key_pair.clone()))
        .await
        .unwrap();
    let b = Log::open(MemoryStorage::new(), Options::new().key_pair(key_pair))
        .await
        .unwrap();
    let blocks: Vec<Vec<u8>> = (0..7u8).map(|i| vec![i; 9]).collect();
    a.append(blocks.clone()).await.unwrap();
    b.append(blocks).await.unwrap();
    assert_eq!(a.tree_hash(None).unwrap(), b.tree_hash(None).unwrap());
    assert_eq!(a.tree_hash(Some(3)).unwrap(), b.tree_hash(Some(3)).unwrap());
    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn extensions_reach_the_remote_handler() {
    use std::sync::mpsc;

    let writer = writable_log().await;
    let reader = Log::open(MemoryStorage::new(), Options::new().key(&writer.key()))
        .await
        .unwrap();

    let (seen_tx, seen_rx) = mpsc::channel();
    reader
        .register_extension(
            "announce",
            std::sync::Arc::new(move |_peer, payload| {
                let _ = seen_tx.send(payload);
            }),
        )
        .await;
    let announce = writer
        .register_extension("announce", std::sync::Arc::new(|_, _| {}))
        .await;

    let (left, right) = tokio::io::duplex(1 << 16);
    writer.replicate_io(true, left).await.unwrap();
    reader.replicate_io(false, right).await.unwrap();

    // Give the channels a moment to establish, then broadcast.
    tokio::time::sleep(Duration::from_millis(50)).await;
    announce.broadcast(b"hello peers".to_vec()).await;

    let payload = tokio::task::spawn_blocking(move || {
        seen_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("extension payload")
    })
    .await
    .unwrap();
    assert_eq!(payload, b"hello peers");

    reader.close().await.unwrap();
    writer.close().await.unwrap();
}

#[tokio::test]
async fn two_logs_share_one_stream() {
    let writer_a = writable_log().await;
    let writer_b = writable_log().await;
    writer_a.append_one(b"from a".to_vec()).await.unwrap();
    writer_b.append_one(b"from b".to_vec()).await.unwrap();

    let reader_a = Log::open(MemoryStorage::new(), Options::new().key(&writer_a.key()))
        .await
        .unwrap();
    let reader_b = Log::open(MemoryStorage::new(), Options::new().key(&writer_b.key()))
        .await
        .unwrap();

    // Both logs replicate over the same pair of streams.
    let (left, right) = tokio::io::duplex(1 << 16);
    let writer_stream = writer_a.replicate_io(true, left).await.unwrap();
    writer_b.replicate(&writer_stream).await.unwrap();
    let reader_stream = reader_a.replicate_io(false, right).await.unwrap();
    reader_b.replicate(&reader_stream).await.unwrap();

    assert_eq!(reader_a.get(0).await.unwrap().unwrap(), b"from a");
    assert_eq!(reader_b.get(0).await.unwrap().unwrap(), b"from b");

    for log in [writer_a, writer_b, reader_a, reader_b] {
        log.close().await.unwrap();
    }
}

#[tokio::test]
async fn peer_events_fire_on_connect() {
    let writer = writable_log().await;
    let mut events = writer.subscribe();
    let reader = Log::open(MemoryStorage::new(), Options::new().key(&writer.key()))
        .await
        .unwrap();

    let (left, right) = tokio::io::duplex(1 << 16);
    writer.replicate_io(true, left).await.unwrap();
    reader.replicate_io(false, right).await.unwrap();

    loop {
        if let Event::PeerAdd { .. } = next_event(&mut events).await {
            break;
        }
    }
    reader.close().await.unwrap();
    writer.close().await.unwrap();
}

#[tokio::test]
async fn on_wait_fires_before_contacting_peers() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let writer = writable_log().await;
    writer.append_one(b"late".to_vec()).await.unwrap();
    let reader = Log::open(MemoryStorage::new(), Options::new().key(&writer.key()))
        .await
        .unwrap();
    let (left, right) = tokio::io::duplex(1 << 16);
    writer.replicate_io(true, left).await.unwrap();
    reader.replicate_io(false, right).await.unwrap();

    let waited = Arc::new(AtomicBool::new(false));
    let flag = waited.clone();
    let options = GetOptions {
        on_wait: Some(Arc::new(move |index| {
            assert_eq!(index, 0);
            flag.store(true, Ordering::SeqCst);
        })),
        ..GetOptions::default()
    };
    assert_eq!(reader.get_with(0, options).await.unwrap().unwrap(), b"late");
    assert!(waited.load(Ordering::SeqCst));

    reader.close().await.unwrap();
    writer.close().await.unwrap();
}
