use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Duration;
use tracing::error;

use tracing_ansilog::init::{init_tracing_with_config, LayerConfig};
use tracing_ansilog::memory::MemoryStore;
use tracing_ansilog::record::Level;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = MemoryStore::new();

    let layer_config = LayerConfig {
        queue_capacity: 1_000,
        commit_interval: Duration::from_millis(200),
        flush_interval: Duration::from_millis(20),
        min_level: Level::Warn,
        enable_stdout: false,
    };

    let sink = init_tracing_with_config(Arc::new(store.clone()), layer_config)?;

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(iteration = i, "custom load test error");
    }

    let elapsed = start.elapsed();
    println!("custom config: sent {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    sink.flush().await;
    let stats = sink.stats();
    println!(
        "rows: {}, transactions: {}, committed: {}, dropped: {}",
        store.len(),
        store.transactions_committed(),
        stats.committed.load(Ordering::Relaxed),
        stats.dropped.load(Ordering::Relaxed),
    );
    Ok(())
}
