use crate::error::SinkError;
use crate::filter::FilterChain;
use crate::record::LogRecord;
use crate::sink::LogSink;
use crate::store::LogStore;
use async_trait::async_trait;
use std::sync::Arc;

/// Sink that writes each record inline, one autocommitted row per call.
///
/// There is no queue and no background task: `fire` returns once the
/// store has answered, and any store error is handed straight back to the
/// caller without retry.
#[derive(Clone)]
pub struct SyncSink {
    store: Arc<dyn LogStore>,
    filters: FilterChain,
}

impl SyncSink {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        SyncSink {
            store,
            filters: FilterChain::new(),
        }
    }

    /// Append a filter that can rewrite or drop records before they are
    /// written.
    pub fn add_filter<F>(&self, filter: F)
    where
        F: Fn(LogRecord) -> Option<LogRecord> + Send + Sync + 'static,
    {
        self.filters.add_filter(filter);
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }
}

#[async_trait]
impl LogSink for SyncSink {
    async fn fire(&self, record: LogRecord) -> Result<(), SinkError> {
        let Some(record) = self.filters.apply(record) else {
            return Ok(());
        };
        self.store.insert(&record).await?;
        Ok(())
    }
}
