use crate::error::SinkError;
use crate::filter::FilterChain;
use crate::record::LogRecord;
use crate::sink::LogSink;
use crate::store::{LogStore, LogTransaction};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Duration, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, warn};

tokio::task_local! {
    /// Set for the lifetime of a worker task.
    static WORKER: ();
}

/// `true` when called from inside a sink worker, including from the store
/// code it drives.
pub fn in_worker() -> bool {
    WORKER.try_with(|_| ()).is_ok()
}

/// Queue capacity used when `0` is requested.
pub const DEFAULT_QUEUE_CAPACITY: usize = 8192;
/// How often the worker commits a non-empty batch.
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(1);
/// Commit cadence while a flush is draining the queue.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Tuning knobs for [`AsyncSink`].
///
/// **Fields**
/// - `queue_capacity`: records that may wait in the queue before `fire`
///   starts blocking producers. `0` selects [`DEFAULT_QUEUE_CAPACITY`].
/// - `commit_interval`: timer period between batch commits.
/// - `flush_interval`: shorter timer period used while flushing.
#[derive(Clone, Debug)]
pub struct AsyncSinkConfig {
    pub queue_capacity: usize,
    pub commit_interval: Duration,
    pub flush_interval: Duration,
}

impl Default for AsyncSinkConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Counters describing what happened to records handed to an [`AsyncSink`].
///
/// After a completed flush, `fired == committed + failed_inserts + lost`.
#[derive(Debug, Default)]
pub struct SinkStats {
    /// Accepted into the queue.
    pub fired: AtomicU64,
    /// Dropped by the filter chain.
    pub filtered: AtomicU64,
    /// Refused because the sink was closed or could not block.
    pub dropped: AtomicU64,
    /// Persisted by a successful commit.
    pub committed: AtomicU64,
    /// Rejected by the store on insert.
    pub failed_inserts: AtomicU64,
    /// Staged in a transaction that could not be committed or opened.
    pub lost: AtomicU64,
    pub failed_commits: AtomicU64,
    pub failed_begins: AtomicU64,
}

/// Tracks how many accepted records the worker has finished with.
///
/// A record is processed once its batch was committed (or failed to
/// commit), its insert failed, or it never made it into the queue.
struct Progress {
    accepted: AtomicU64,
    processed: watch::Sender<u64>,
}

impl Progress {
    fn new() -> Self {
        let (processed, _) = watch::channel(0);
        Progress {
            accepted: AtomicU64::new(0),
            processed,
        }
    }

    fn accept(&self) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self, count: u64) {
        if count > 0 {
            self.processed.send_modify(|processed| *processed += count);
        }
    }

    fn outstanding(&self) -> u64 {
        let processed = *self.processed.borrow();
        self.accepted.load(Ordering::SeqCst).saturating_sub(processed)
    }

    async fn wait_processed(&self, target: u64) {
        let mut processed = self.processed.subscribe();
        // The sender lives as long as `self`, so this only returns early
        // if the predicate already holds.
        let _ = processed.wait_for(|processed| *processed >= target).await;
    }
}

struct Shared {
    queue: mpsc::Sender<LogRecord>,
    stop: mpsc::Sender<oneshot::Sender<()>>,
    interval: watch::Sender<Duration>,
    flush_interval: Duration,
    filters: FilterChain,
    progress: Arc<Progress>,
    stats: Arc<SinkStats>,
}

/// Sink that queues records and persists them from a background worker
/// in timer-driven batches, one transaction per batch.
///
/// `fire` returns as soon as the record is queued; when the queue is full
/// it waits for the worker to make room instead of dropping the record.
/// Callers that need delivery guarantees must call [`AsyncSink::flush`]
/// before the process exits: nothing is flushed automatically.
///
/// Clones share the same queue, worker and filter chain.
#[derive(Clone)]
pub struct AsyncSink {
    shared: Arc<Shared>,
}

impl AsyncSink {
    /// Create a sink with default timing and spawn its worker on the
    /// current Tokio runtime.
    ///
    /// **Parameters**
    /// - `store`: backing store; the worker is its only writer.
    /// - `queue_capacity`: bound of the pending queue, `0` for
    ///   [`DEFAULT_QUEUE_CAPACITY`].
    pub fn new(store: Arc<dyn LogStore>, queue_capacity: usize) -> Self {
        Self::with_config(
            store,
            AsyncSinkConfig {
                queue_capacity,
                ..AsyncSinkConfig::default()
            },
        )
    }

    /// Create a sink from an explicit [`AsyncSinkConfig`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_config(store: Arc<dyn LogStore>, config: AsyncSinkConfig) -> Self {
        let capacity = if config.queue_capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            config.queue_capacity
        };

        let (queue_tx, queue_rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (interval_tx, interval_rx) = watch::channel(config.commit_interval);

        let progress = Arc::new(Progress::new());
        let stats = Arc::new(SinkStats::default());

        let worker = Worker {
            store,
            queue: queue_rx,
            stop: stop_rx,
            interval: interval_rx,
            ticker: ticker(config.commit_interval),
            progress: Arc::clone(&progress),
            stats: Arc::clone(&stats),
        };
        tokio::spawn(WORKER.scope((), worker.run()));

        AsyncSink {
            shared: Arc::new(Shared {
                queue: queue_tx,
                stop: stop_tx,
                interval: interval_tx,
                flush_interval: config.flush_interval,
                filters: FilterChain::new(),
                progress,
                stats,
            }),
        }
    }

    /// Append a filter that can rewrite or drop records before they are
    /// queued.
    pub fn add_filter<F>(&self, filter: F)
    where
        F: Fn(LogRecord) -> Option<LogRecord> + Send + Sync + 'static,
    {
        self.shared.filters.add_filter(filter);
    }

    pub fn filters(&self) -> &FilterChain {
        &self.shared.filters
    }

    pub fn stats(&self) -> Arc<SinkStats> {
        Arc::clone(&self.shared.stats)
    }

    /// Records accepted but not yet processed by the worker.
    pub fn outstanding(&self) -> u64 {
        self.shared.progress.outstanding()
    }

    /// Filter `record` and queue it for the worker.
    ///
    /// Waits while the queue is full. Returns `Err(SinkError::Closed)`
    /// once the sink has been flushed.
    pub async fn fire(&self, record: LogRecord) -> Result<(), SinkError> {
        let Some(record) = self.admit(record) else {
            return Ok(());
        };

        if self.shared.queue.send(record).await.is_err() {
            self.refuse();
            return Err(SinkError::Closed);
        }
        self.shared.stats.fired.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Same as [`AsyncSink::fire`] for callers that cannot `.await`, such
    /// as a `tracing` layer.
    ///
    /// A full queue blocks the calling thread. Two callers are refused with
    /// `SinkError::WouldBlock` instead, because blocking would stall the
    /// worker: a current-thread runtime, and the worker task itself.
    pub fn fire_blocking(&self, record: LogRecord) -> Result<(), SinkError> {
        let Some(record) = self.admit(record) else {
            return Ok(());
        };

        let sent = match self.shared.queue.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(SinkError::Closed),
            Err(TrySendError::Full(record)) => self.send_blocking(record),
        };

        match sent {
            Ok(()) => {
                self.shared.stats.fired.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.refuse();
                Err(e)
            }
        }
    }

    /// Wait until every record fired before this call has been processed,
    /// then stop the worker.
    ///
    /// The commit timer is shortened to the flush interval while waiting.
    /// Records fired concurrently with the flush are committed if they
    /// reached the queue before the worker stopped, and refused with
    /// `SinkError::Closed` otherwise. Returns immediately if the sink was
    /// already flushed.
    pub async fn flush(&self) {
        let shared = &self.shared;
        let target = shared.progress.accepted.load(Ordering::SeqCst);
        shared.interval.send_replace(shared.flush_interval);

        tokio::select! {
            _ = shared.progress.wait_processed(target) => {}
            _ = shared.stop.closed() => return,
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if shared.stop.send(ack_tx).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    fn admit(&self, record: LogRecord) -> Option<LogRecord> {
        match self.shared.filters.apply(record) {
            Some(record) => {
                self.shared.progress.accept();
                Some(record)
            }
            None => {
                self.shared.stats.filtered.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn refuse(&self) {
        self.shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
        self.shared.progress.release(1);
    }

    fn send_blocking(&self, record: LogRecord) -> Result<(), SinkError> {
        let queue = &self.shared.queue;
        if in_worker() {
            return Err(SinkError::WouldBlock);
        }
        match Handle::try_current() {
            Err(_) => queue.blocking_send(record).map_err(|_| SinkError::Closed),
            Ok(handle) => match handle.runtime_flavor() {
                RuntimeFlavor::CurrentThread => Err(SinkError::WouldBlock),
                _ => tokio::task::block_in_place(|| handle.block_on(queue.send(record)))
                    .map_err(|_| SinkError::Closed),
            },
        }
    }
}

#[async_trait]
impl LogSink for AsyncSink {
    async fn fire(&self, record: LogRecord) -> Result<(), SinkError> {
        AsyncSink::fire(self, record).await
    }

    async fn flush(&self) {
        AsyncSink::flush(self).await
    }
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

enum Event {
    Record(LogRecord),
    Tick,
    Stop(oneshot::Sender<()>),
    Closed,
}

/// Records staged in one open transaction.
struct Batch {
    tx: Box<dyn LogTransaction>,
    /// Records taken off the queue, whether or not their insert worked.
    taken: u64,
    /// Records the transaction accepted.
    staged: u64,
}

impl Batch {
    fn new(tx: Box<dyn LogTransaction>) -> Self {
        Batch { tx, taken: 0, staged: 0 }
    }

    async fn insert(&mut self, record: LogRecord, stats: &SinkStats) {
        self.taken += 1;
        match self.tx.insert(&record).await {
            Ok(()) => self.staged += 1,
            Err(e) => {
                stats.failed_inserts.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, record = ?record, "can't insert log record");
            }
        }
    }
}

/// Single consumer of the queue and sole owner of store transactions.
struct Worker {
    store: Arc<dyn LogStore>,
    queue: mpsc::Receiver<LogRecord>,
    stop: mpsc::Receiver<oneshot::Sender<()>>,
    interval: watch::Receiver<Duration>,
    ticker: Interval,
    progress: Arc<Progress>,
    stats: Arc<SinkStats>,
}

impl Worker {
    async fn run(mut self) {
        debug!("log sink worker started");
        loop {
            // Idle: no transaction is open until a record shows up.
            let first = match self.next_event().await {
                Event::Record(record) => record,
                Event::Tick => continue,
                Event::Stop(ack) => return self.shutdown(None, ack).await,
                Event::Closed => break,
            };

            let tx = loop {
                match self.store.begin().await {
                    Ok(tx) => break tx,
                    Err(e) => {
                        self.stats.failed_begins.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "can't open log transaction, retrying on next tick");
                    }
                }
                if let Some(ack) = self.wait_for_retry().await {
                    return self.shutdown(Some(first), ack).await;
                }
            };

            let mut batch = Batch::new(tx);
            batch.insert(first, &self.stats).await;

            loop {
                match self.next_event().await {
                    Event::Record(record) => batch.insert(record, &self.stats).await,
                    Event::Tick => break,
                    Event::Stop(ack) => {
                        self.commit(batch).await;
                        return self.shutdown(None, ack).await;
                    }
                    Event::Closed => {
                        self.commit(batch).await;
                        debug!("log sink dropped, worker exiting");
                        return;
                    }
                }
            }

            self.commit(batch).await;
        }
        debug!("log sink dropped, worker exiting");
    }

    async fn next_event(&mut self) -> Event {
        loop {
            tokio::select! {
                record = self.queue.recv() => {
                    return match record {
                        Some(record) => Event::Record(record),
                        None => Event::Closed,
                    };
                }
                _ = self.ticker.tick() => return Event::Tick,
                Some(ack) = self.stop.recv() => return Event::Stop(ack),
                Ok(()) = self.interval.changed() => self.reset_ticker(),
            }
        }
    }

    /// Wait for the next tick before retrying `begin`. Returns the ack
    /// channel if a stop request arrives first.
    async fn wait_for_retry(&mut self) -> Option<oneshot::Sender<()>> {
        loop {
            tokio::select! {
                _ = self.ticker.tick() => return None,
                Some(ack) = self.stop.recv() => return Some(ack),
                Ok(()) = self.interval.changed() => self.reset_ticker(),
            }
        }
    }

    fn reset_ticker(&mut self) {
        let period = *self.interval.borrow_and_update();
        debug!(?period, "log sink commit interval changed");
        self.ticker = ticker(period);
    }

    async fn commit(&mut self, batch: Batch) {
        let Batch { tx, taken, staged } = batch;
        match tx.commit().await {
            Ok(()) => {
                self.stats.committed.fetch_add(staged, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.failed_commits.fetch_add(1, Ordering::Relaxed);
                self.stats.lost.fetch_add(staged, Ordering::Relaxed);
                error!(error = %e, records = staged, "can't commit log transaction");
            }
        }
        self.progress.release(taken);
    }

    /// Close the queue, persist whatever is still in it, then acknowledge
    /// the stop request.
    async fn shutdown(mut self, held: Option<LogRecord>, ack: oneshot::Sender<()>) {
        self.queue.close();

        let mut leftovers: Vec<LogRecord> = held.into_iter().collect();
        while let Some(record) = self.queue.recv().await {
            leftovers.push(record);
        }

        if !leftovers.is_empty() {
            match self.store.begin().await {
                Ok(tx) => {
                    let mut batch = Batch::new(tx);
                    for record in leftovers {
                        batch.insert(record, &self.stats).await;
                    }
                    self.commit(batch).await;
                }
                Err(e) => {
                    let count = leftovers.len() as u64;
                    self.stats.failed_begins.fetch_add(1, Ordering::Relaxed);
                    self.stats.lost.fetch_add(count, Ordering::Relaxed);
                    error!(error = %e, records = count, "can't open final log transaction, records lost");
                    self.progress.release(count);
                }
            }
        }

        debug!("log sink worker stopped");
        let _ = ack.send(());
    }
}
