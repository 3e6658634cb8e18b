//! Integration scenarios for the queue backing (component E) atop a real
//! message store.

use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use qstore::acknowledgements::Confirmer;
use qstore::config::StoreConfig;
use qstore::ids::{ClientRef, MessageId};
use qstore::queue::{self, QueueConfig};

fn mk_id(n: u8) -> MessageId {
    MessageId::from_bytes([n; 16])
}

async fn open_store(dir: &std::path::Path) -> qstore::store::MessageStoreHandle {
    let config = StoreConfig::from_path(dir).build();
    qstore::store::open(config, Confirmer::noop()).await.unwrap()
}

fn index_path(dir: &std::path::Path) -> std::path::PathBuf {
    dir.join("queue.qidx")
}

/// Polls `cond` every 5ms until it resolves to `true`, or panics after
/// `timeout`. `cond` is async so callers can poll real store/queue state
/// (both only expose `async fn` accessors).
async fn wait_until<F, Fut>(mut cond: F, timeout: Duration)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if cond().await {
            return;
        }
        if start.elapsed() > timeout {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publish_fetch_ack_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let queue = queue::open(QueueConfig::default(), store.clone(), Confirmer::noop(), 0, index_path(dir.path()));

    let client = ClientRef::new();
    let id = mk_id(1);
    queue
        .publish(client, id, Bytes::from_static(b"hello"), false, false)
        .await
        .unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.len, 1);
    assert_eq!(stats.ram_msg_count, 1);

    let deliveries = queue.fetch(10).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].payload, Bytes::from_static(b"hello"));
    assert_eq!(deliveries[0].meta.id, id);

    // Fetched-but-unacked entries are no longer in the backlog, but still
    // resident as pending acks.
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.len, 0);
    assert_eq!(stats.ram_ack_count, 1);

    queue.ack(vec![deliveries[0].tag]).await.unwrap();
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.ram_ack_count, 0);

    // Acking dropped the queue's reference on the underlying message.
    wait_until(
        || async { store.read(id).await.unwrap().is_none() },
        Duration::from_secs(2),
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requeue_puts_entries_back_at_the_head() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let queue = queue::open(QueueConfig::default(), store, Confirmer::noop(), 0, index_path(dir.path()));
    let client = ClientRef::new();

    let first = mk_id(1);
    let second = mk_id(2);
    queue
        .publish(client, first, Bytes::from_static(b"one"), false, false)
        .await
        .unwrap();
    queue
        .publish(client, second, Bytes::from_static(b"two"), false, false)
        .await
        .unwrap();

    let delivered = queue.fetch(2).await.unwrap();
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[0].meta.id, first);
    assert_eq!(delivered[1].meta.id, second);

    // Requeue only the second delivery; it should come back ahead of
    // anything freshly fetched, re-reading its payload from the store
    // since the requeue path drops the cached copy.
    queue.requeue(vec![delivered[1].tag]).await.unwrap();

    let redelivered = queue.fetch(1).await.unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].meta.id, second);
    assert_eq!(redelivered[0].payload, Bytes::from_static(b"two"));

    queue.ack(vec![delivered[0].tag, redelivered[0].tag]).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropwhile_expires_a_prefix_and_stops_at_the_first_survivor() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let queue = queue::open(QueueConfig::default(), store, Confirmer::noop(), 0, index_path(dir.path()));
    let client = ClientRef::new();

    for n in 0..5u8 {
        queue
            .publish(client, mk_id(n), Bytes::from_static(b"x"), false, false)
            .await
            .unwrap();
    }

    // Entries are published with ascending seq numbers starting at the
    // transient threshold (0 here); drop everything with seq < 3.
    let dropped = queue.dropwhile(|meta| meta.seq < 3).await.unwrap();
    assert_eq!(dropped.len(), 3);
    assert_eq!(dropped.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![0, 1, 2]);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.len, 2);

    let remaining = queue.fetch(10).await.unwrap();
    assert_eq!(remaining.len(), 2);
    assert_eq!(remaining[0].meta.seq, 3);
    assert_eq!(remaining[1].meta.seq, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lowering_target_ram_count_evicts_cached_payloads_outside_the_window() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let config = QueueConfig::builder().io_batch_size(5).build();
    let queue = queue::open(config, store, Confirmer::noop(), 0, index_path(dir.path()));
    let client = ClientRef::new();

    // Publish enough entries that some fall outside the always-cached
    // trailing window, so a reduction round has something to evict.
    for n in 0..80u8 {
        queue
            .publish(client, mk_id(n), Bytes::from_static(b"payload"), false, false)
            .await
            .unwrap();
    }

    let before = queue.stats().await.unwrap();
    assert_eq!(before.ram_msg_count, 80);

    queue.set_target_ram_count(0).unwrap();

    wait_until(
        || async { queue.stats().await.unwrap().ram_msg_count < 80 },
        Duration::from_secs(2),
    )
    .await;

    let after = queue.stats().await.unwrap();
    assert!(after.ram_msg_count <= 75, "reduction evicts up to io_batch_size entries per round");
    // With target_ram_count 0, quota left over after cache eviction pages
    // positions out to the queue index entirely, so some entries move from
    // the resident backlog into delta while the total length stays 80.
    assert_eq!(after.len, 80, "reduction pages positions out but never drops them");
    assert!(after.delta_count > 0, "positions behind the window page out to delta");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lowering_target_ram_count_also_evicts_unacked_delivery_cache() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let config = QueueConfig::default();
    let io_batch_size = config.io_batch_size() as u64;
    let queue = queue::open(config, store, Confirmer::noop(), 0, index_path(dir.path()));
    let client = ClientRef::new();

    for n in 0..100u8 {
        queue
            .publish(client, mk_id(n), Bytes::from_static(b"payload"), false, false)
            .await
            .unwrap();
    }
    let delivered = queue.fetch(100).await.unwrap();
    assert_eq!(delivered.len(), 100, "all 100 are delivered but left unacked");

    let before = queue.stats().await.unwrap();
    assert_eq!(before.ram_msg_count, 0);
    assert_eq!(before.ram_ack_count, 100);

    queue.set_target_ram_count(0).unwrap();

    wait_until(
        || async { queue.stats().await.unwrap().ram_ack_count < 100 },
        Duration::from_secs(2),
    )
    .await;

    let after = queue.stats().await.unwrap();
    let resident = after.ram_msg_count + after.ram_ack_count;
    assert!(
        resident <= 100u64.saturating_sub(io_batch_size),
        "property 9: ram_msg_count + ram_ack_count <= max(prev - io_batch_size, target); resident={resident}"
    );
    // Delivered-but-unacked entries keep their tag resolvable even once
    // their payload cache is gone.
    assert_eq!(after.ram_ack_count, resident);
    queue.ack(delivered.iter().map(|d| d.tag).collect()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publishing_with_zero_target_ram_count_pages_almost_everything_to_delta() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let config = QueueConfig::builder().io_batch_size(64).build();
    let io_batch_size = config.io_batch_size();
    let queue = queue::open(config, store, Confirmer::noop(), 0, index_path(dir.path()));
    let client = ClientRef::new();
    queue.set_target_ram_count(0).unwrap();

    for n in 0..1000u32 {
        let mut raw = [0u8; 16];
        raw[12..16].copy_from_slice(&n.to_be_bytes());
        queue
            .publish(client, MessageId::from_bytes(raw), Bytes::from_static(b"x"), true, false)
            .await
            .unwrap();
    }

    wait_until(
        || async { queue.stats().await.unwrap().delta_count > 900 },
        Duration::from_secs(5),
    )
    .await;

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.len, 1000, "no position is lost, only paged out");
    assert!(stats.ram_msg_count <= 128, "only the ready window plus in-flight batches stay resident");

    let before_delta = stats.delta_count;
    let fetched = queue.fetch(10).await.unwrap();
    assert_eq!(fetched.len(), 10);
    assert_eq!(fetched[0].meta.seq, 0, "fetch stays in strict FIFO order");
    let after = queue.stats().await.unwrap();
    assert!(
        before_delta - after.delta_count <= io_batch_size as u64,
        "a refill batch shrinks delta by at most one io_batch_size load"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ram_duration_starts_infinite_and_updates_after_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let config = QueueConfig::builder()
        .ram_duration_update_interval(Duration::from_millis(20))
        .build();
    let queue = queue::open(config, store, Confirmer::noop(), 0, index_path(dir.path()));
    let client = ClientRef::new();

    let initial = queue.stats().await.unwrap();
    assert_eq!(initial.ram_duration_secs, f64::INFINITY);

    queue
        .publish(client, mk_id(1), Bytes::from_static(b"x"), false, false)
        .await
        .unwrap();

    wait_until(
        || async { queue.stats().await.unwrap().ram_duration_secs.is_finite() },
        Duration::from_secs(2),
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transaction_commit_makes_publishes_and_acks_visible_together() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let queue = queue::open(QueueConfig::default(), store, Confirmer::noop(), 0, index_path(dir.path()));
    let client = ClientRef::new();

    let staged = mk_id(1);
    queue
        .txn_publish(client, 1, staged, Bytes::from_static(b"staged"), true)
        .unwrap();

    // Nothing is visible until commit.
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.len, 0);

    queue.txn_commit(client, 1).await.unwrap();
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.len, 1);

    let delivered = queue.fetch(1).await.unwrap();
    assert_eq!(delivered[0].meta.id, staged);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transaction_rollback_discards_staged_publishes() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path()).await;
    let queue = queue::open(QueueConfig::default(), store, Confirmer::noop(), 0, index_path(dir.path()));
    let client = ClientRef::new();

    queue
        .txn_publish(client, 1, mk_id(1), Bytes::from_static(b"staged"), false)
        .unwrap();
    queue.txn_rollback(client, 1).await.unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.len, 0);

    // Committing the same (now-forgotten) txn id is a no-op, not an error.
    queue.txn_commit(client, 1).await.unwrap();
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.len, 0);
}
