use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};
use tokio::time::{sleep, timeout, Duration};

use tracing_ansilog::async_sink::{AsyncSink, AsyncSinkConfig};
use tracing_ansilog::error::SinkError;
use tracing_ansilog::filter::min_level;
use tracing_ansilog::memory::MemoryStore;
use tracing_ansilog::record::{Level, LogRecord};
use tracing_ansilog::store::{LogStore, LogTransaction, StoreError};

fn sink_with(store: &MemoryStore, commit_interval: Duration) -> AsyncSink {
    AsyncSink::with_config(
        Arc::new(store.clone()),
        AsyncSinkConfig {
            commit_interval,
            flush_interval: Duration::from_millis(10),
            ..AsyncSinkConfig::default()
        },
    )
}

fn messages(store: &MemoryStore) -> Vec<String> {
    store.rows().into_iter().map(|row| row.record.message).collect()
}

/// Store whose `begin` waits for a permit, so a test can hold the worker
/// right after it took a record off the queue.
struct GatedStore {
    inner: MemoryStore,
    gate: Arc<Semaphore>,
    entered: Arc<Notify>,
}

#[async_trait]
impl LogStore for GatedStore {
    async fn begin(&self) -> Result<Box<dyn LogTransaction>, StoreError> {
        self.entered.notify_one();
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| StoreError::Begin(e.to_string()))?;
        permit.forget();
        self.inner.begin().await
    }

    async fn insert(&self, record: &LogRecord) -> Result<(), StoreError> {
        self.inner.insert(record).await
    }
}

#[tokio::test]
async fn full_queue_blocks_producers_until_worker_dequeues() {
    let store = MemoryStore::new();
    let gate = Arc::new(Semaphore::new(0));
    let entered = Arc::new(Notify::new());
    let sink = AsyncSink::new(
        Arc::new(GatedStore {
            inner: store.clone(),
            gate: Arc::clone(&gate),
            entered: Arc::clone(&entered),
        }),
        1,
    );

    // The worker takes "first" off the queue and parks in `begin`.
    sink.fire(LogRecord::new(Level::Error, "first")).await.unwrap();
    entered.notified().await;

    // "second" takes the only slot.
    sink.fire(LogRecord::new(Level::Error, "second")).await.unwrap();

    let producer = sink.clone();
    let third = tokio::spawn(async move { producer.fire(LogRecord::new(Level::Error, "third")).await });

    sleep(Duration::from_millis(50)).await;
    assert!(!third.is_finished(), "fire returned while the queue was full");

    gate.add_permits(16);
    timeout(Duration::from_secs(5), third)
        .await
        .expect("producer stayed blocked after the worker made room")
        .unwrap()
        .unwrap();

    sink.flush().await;
    assert_eq!(messages(&store), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn fire_blocking_refuses_full_queue_on_current_thread_runtime() {
    let store = MemoryStore::new();
    let gate = Arc::new(Semaphore::new(0));
    let entered = Arc::new(Notify::new());
    let sink = AsyncSink::new(
        Arc::new(GatedStore {
            inner: store.clone(),
            gate: Arc::clone(&gate),
            entered: Arc::clone(&entered),
        }),
        1,
    );

    sink.fire(LogRecord::new(Level::Error, "first")).await.unwrap();
    entered.notified().await;
    sink.fire_blocking(LogRecord::new(Level::Error, "second")).unwrap();

    // Blocking here would also stall the worker.
    let err = sink.fire_blocking(LogRecord::new(Level::Error, "third")).unwrap_err();
    assert!(matches!(err, SinkError::WouldBlock));
    assert_eq!(sink.stats().dropped.load(Ordering::Relaxed), 1);
    assert_eq!(sink.outstanding(), 2);

    gate.add_permits(16);
    timeout(Duration::from_secs(5), sink.flush())
        .await
        .expect("flush waited for the refused record");
    assert_eq!(sink.outstanding(), 0);
    assert_eq!(messages(&store), vec!["first", "second"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flush_ignores_records_fired_during_it() {
    let store = MemoryStore::new();
    let sink = AsyncSink::with_config(
        Arc::new(store.clone()),
        AsyncSinkConfig {
            queue_capacity: 64,
            commit_interval: Duration::from_secs(60),
            flush_interval: Duration::from_millis(10),
        },
    );

    for i in 0..200 {
        sink.fire(LogRecord::new(Level::Error, format!("before {i}"))).await.unwrap();
    }

    let producer = sink.clone();
    let late = tokio::spawn(async move {
        let mut attempts = 0u64;
        loop {
            attempts += 1;
            match producer.fire(LogRecord::new(Level::Error, format!("during {attempts}"))).await {
                Ok(()) => tokio::task::yield_now().await,
                Err(SinkError::Closed) => return attempts,
                Err(e) => panic!("unexpected refusal: {e}"),
            }
        }
    });

    timeout(Duration::from_secs(5), sink.flush())
        .await
        .expect("flush kept waiting for concurrent producers");
    let attempts = timeout(Duration::from_secs(5), late).await.unwrap().unwrap();

    let stored = messages(&store);
    for i in 0..200 {
        assert!(stored.contains(&format!("before {i}")), "before {i} missing");
    }

    let stats = sink.stats();
    let committed = stats.committed.load(Ordering::Relaxed);
    let dropped = stats.dropped.load(Ordering::Relaxed);
    assert_eq!(committed as usize, stored.len());
    assert_eq!(committed + dropped, 200 + attempts);
    assert_eq!(sink.outstanding(), 0);
}

#[tokio::test]
async fn every_record_is_committed_or_reported_exactly_once() {
    let store = MemoryStore::new();
    store.fail_inserts_where(|record| record.message.ends_with('7'));
    let sink = sink_with(&store, Duration::from_millis(20));

    for i in 0..100 {
        sink.fire(LogRecord::new(Level::Error, format!("record {i}"))).await.unwrap();
    }
    sink.flush().await;

    let stored = messages(&store);
    let unique: HashSet<_> = stored.iter().cloned().collect();
    assert_eq!(unique.len(), stored.len(), "duplicate rows");
    assert_eq!(stored.len(), 90);
    assert!(stored.iter().all(|message| !message.ends_with('7')));

    let stats = sink.stats();
    assert_eq!(stats.fired.load(Ordering::Relaxed), 100);
    assert_eq!(stats.committed.load(Ordering::Relaxed), 90);
    assert_eq!(stats.failed_inserts.load(Ordering::Relaxed), 10);
    assert_eq!(stats.lost.load(Ordering::Relaxed), 0);
    assert_eq!(sink.outstanding(), 0);
}

#[tokio::test]
async fn dropping_filter_prevents_any_write() {
    let store = MemoryStore::new();
    let sink = sink_with(&store, Duration::from_millis(10));
    sink.add_filter(|_| None);

    for i in 0..250 {
        sink.fire(LogRecord::new(Level::Panic, format!("record {i}"))).await.unwrap();
    }
    sink.flush().await;

    assert!(store.is_empty());
    assert_eq!(store.transactions_begun(), 0);
    assert_eq!(sink.stats().filtered.load(Ordering::Relaxed), 250);
}

#[tokio::test]
async fn later_filters_never_see_dropped_records() {
    let store = MemoryStore::new();
    let sink = sink_with(&store, Duration::from_millis(10));
    let tagged = Arc::new(AtomicUsize::new(0));

    sink.add_filter(min_level(Level::Warn));
    let seen = Arc::clone(&tagged);
    sink.add_filter(move |record: LogRecord| {
        seen.fetch_add(1, Ordering::SeqCst);
        Some(record.with_field("tag", "checked"))
    });

    sink.fire(LogRecord::new(Level::Debug, "dropped")).await.unwrap();
    sink.fire(LogRecord::new(Level::Warn, "kept")).await.unwrap();
    sink.flush().await;

    assert_eq!(tagged.load(Ordering::SeqCst), 1);
    let rows = store.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record.message, "kept");
    assert_eq!(rows[0].record.fields["tag"], "checked");
}

#[tokio::test(start_paused = true)]
async fn timer_commits_first_non_empty_interval() {
    let store = MemoryStore::new();
    let sink = sink_with(&store, Duration::from_millis(50));

    // Two empty ticks go by without opening anything.
    sleep(Duration::from_millis(120)).await;
    assert_eq!(store.transactions_begun(), 0);

    sink.fire(LogRecord::new(Level::Error, "timed")).await.unwrap();
    sleep(Duration::from_millis(60)).await;

    assert_eq!(messages(&store), vec!["timed"]);
    assert_eq!(store.transactions_committed(), 1);
    assert_eq!(sink.outstanding(), 0);
}

#[tokio::test]
async fn flush_without_pending_records_opens_no_transaction() {
    let store = MemoryStore::new();
    let sink = sink_with(&store, Duration::from_secs(60));

    timeout(Duration::from_millis(500), sink.flush())
        .await
        .expect("flush with nothing pending should return immediately");

    assert_eq!(store.transactions_begun(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_lose_nothing() {
    const PRODUCERS: usize = 10;
    const PER_PRODUCER: usize = 1000;

    let store = MemoryStore::new();
    let sink = sink_with(&store, Duration::from_millis(10));

    let mut handles = Vec::new();
    for producer in 0..PRODUCERS {
        let sink = sink.clone();
        handles.push(tokio::spawn(async move {
            for seq in 0..PER_PRODUCER {
                let record = LogRecord::new(Level::Info, format!("p{producer}-{seq}"))
                    .with_field("producer", producer)
                    .with_field("seq", seq);
                sink.fire(record).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    sink.flush().await;

    let rows = store.rows();
    assert_eq!(rows.len(), PRODUCERS * PER_PRODUCER);

    let ids: HashSet<_> = rows.iter().map(|row| row.id).collect();
    assert_eq!(ids.len(), rows.len(), "duplicate primary keys");

    // Each producer's records keep their submission order.
    let mut last_seq = vec![None; PRODUCERS];
    for row in &rows {
        let producer = row.record.fields["producer"].as_u64().unwrap() as usize;
        let seq = row.record.fields["seq"].as_u64().unwrap();
        if let Some(previous) = last_seq[producer] {
            assert!(seq > previous, "producer {producer} reordered");
        }
        last_seq[producer] = Some(seq);
    }
}
