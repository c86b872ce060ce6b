use crate::async_sink::{
    AsyncSink, AsyncSinkConfig, DEFAULT_COMMIT_INTERVAL, DEFAULT_FLUSH_INTERVAL, DEFAULT_QUEUE_CAPACITY,
};
use crate::backend::{connect_store, parse_dsn, DsnError, StoreBuildError, DEFAULT_TABLE};
use crate::env::*;
use crate::filter::{ignore_field, min_level};
use crate::layer::SinkLayer;
use crate::record::Level;
use crate::store::LogStore;
use std::sync::Arc;
use tokio::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

/// Field name that keeps an event out of the store when present.
pub const IGNORE_FIELD: &str = "ignore";

/// Logging layer configuration.
///
/// **Fields**
/// - `queue_capacity`: maximum number of records waiting for the worker
///   before producers start blocking.
/// - `commit_interval`: how often a non-empty batch is committed.
/// - `flush_interval`: commit cadence while [`AsyncSink::flush`] drains.
/// - `min_level`: least severe level that is persisted.
/// - `enable_stdout`: if `true`, a `tracing_subscriber::fmt` layer is
///   added next to the [`SinkLayer`] and events are printed to the
///   console with ANSI colors.
#[derive(Clone, Debug)]
pub struct LayerConfig {
    pub queue_capacity: usize,
    pub commit_interval: Duration,
    pub flush_interval: Duration,
    pub min_level: Level,
    pub enable_stdout: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            min_level: Level::Error,
            enable_stdout: true,
        }
    }
}

impl LayerConfig {
    /// Build a configuration from the `LOG_SINK_*` environment variables,
    /// using [`LayerConfig::default`] for anything unset or malformed.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_capacity: env_parse_or(LOG_SINK_QUEUE_CAPACITY_ENV, defaults.queue_capacity),
            commit_interval: env_millis_or(LOG_SINK_COMMIT_INTERVAL_MS_ENV, defaults.commit_interval),
            flush_interval: env_millis_or(LOG_SINK_FLUSH_INTERVAL_MS_ENV, defaults.flush_interval),
            min_level: env_parse_or(LOG_SINK_LEVEL_ENV, defaults.min_level),
            enable_stdout: env_parse_or(LOG_SINK_STDOUT_ENV, defaults.enable_stdout),
        }
    }

    fn sink_config(&self) -> AsyncSinkConfig {
        AsyncSinkConfig {
            queue_capacity: self.queue_capacity,
            commit_interval: self.commit_interval,
            flush_interval: self.flush_interval,
        }
    }
}

fn env_millis_or(key: &str, default: Duration) -> Duration {
    let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(env_parse_or(key, default))
}

/// Error type returned while installing the global subscriber.
#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Dsn(#[from] DsnError),

    #[error(transparent)]
    Store(#[from] StoreBuildError),

    #[error("can't set global subscriber: {0}")]
    SetGlobal(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Create the [`AsyncSink`] that [`init_tracing_with_config`] installs:
/// records carrying an `ignore` field and records below
/// `config.min_level` are filtered out.
pub fn build_sink(store: Arc<dyn LogStore>, config: &LayerConfig) -> AsyncSink {
    let sink = AsyncSink::with_config(store, config.sink_config());
    sink.add_filter(ignore_field(IGNORE_FIELD));
    sink.add_filter(min_level(config.min_level));
    sink
}

/// Initialize global `tracing` subscriber using the provided store and
/// [`LayerConfig`].
///
/// **Parameters**
/// - `store`: [`LogStore`] the sink's worker writes into.
/// - `config`: [`LayerConfig`] controlling queueing, commit timing and
///   console output.
///
/// **Returns**
///
/// The [`AsyncSink`] behind the layer. Call [`AsyncSink::flush`] on it
/// before the process exits, otherwise queued records may be lost.
///
/// Must be called from within a Tokio runtime.
pub fn init_tracing_with_config(store: Arc<dyn LogStore>, config: LayerConfig) -> Result<AsyncSink, InitError> {
    let sink = build_sink(store, &config);
    let layer = SinkLayer::new(sink.clone());

    // `fmt::Layer` changes the subscriber type, so both shapes are built
    // separately.
    if config.enable_stdout {
        let fmt_layer = tracing_subscriber::fmt::layer().with_ansi(true);
        let subscriber = Registry::default().with(layer).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = Registry::default().with(layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(sink)
}

/// Initialize tracing with sensible defaults.
///
/// Equivalent to calling [`init_tracing_with_config`] with
/// [`LayerConfig::default`]: only `ERROR` events are persisted and
/// everything is echoed to the console.
pub fn init_tracing(store: Arc<dyn LogStore>) -> Result<AsyncSink, InitError> {
    init_tracing_with_config(store, LayerConfig::default())
}

/// Connect the store named by `LOG_SINK_DSN` (default `memory://`) and
/// initialize tracing with [`LayerConfig::from_env`].
pub async fn init_tracing_from_env() -> Result<AsyncSink, InitError> {
    let store_config = parse_dsn(&env_or(LOG_SINK_DSN_ENV, "memory://"))?
        .with_table(env_or(LOG_SINK_TABLE_ENV, DEFAULT_TABLE));
    let store = connect_store(&store_config).await?;
    init_tracing_with_config(store, LayerConfig::from_env())
}
