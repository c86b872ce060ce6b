use std::sync::Arc;
use std::time::Instant;
use tracing::error;

use tracing_ansilog::init::{init_tracing_with_config, LayerConfig};
use tracing_ansilog::noop_store::NoopStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(NoopStore);
    let config = LayerConfig {
        enable_stdout: false,
        ..LayerConfig::default()
    };
    let sink = init_tracing_with_config(store, config)?;

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(iteration = i, "default load test error");
    }

    let elapsed = start.elapsed();
    println!("default config: sent {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    sink.flush().await;
    println!("flushed in {:?}", start.elapsed() - elapsed);
    Ok(())
}
