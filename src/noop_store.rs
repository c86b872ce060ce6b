use crate::record::LogRecord;
use crate::store::{LogStore, LogTransaction, StoreError};
use async_trait::async_trait;

/// A store that simply drops all records.
///
/// Useful for measuring the overhead of the sinks themselves without any
/// database I/O.
#[derive(Clone, Default)]
pub struct NoopStore;

#[async_trait]
impl LogStore for NoopStore {
    async fn begin(&self) -> Result<Box<dyn LogTransaction>, StoreError> {
        Ok(Box::new(NoopStore))
    }

    async fn insert(&self, _record: &LogRecord) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl LogTransaction for NoopStore {
    async fn insert(&mut self, _record: &LogRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}
