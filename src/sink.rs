use crate::error::SinkError;
use crate::record::LogRecord;
use async_trait::async_trait;

/// Destination that accepts [`LogRecord`]s from the logging front-end.
///
/// Both [`SyncSink`](crate::sync_sink::SyncSink) and
/// [`AsyncSink`](crate::async_sink::AsyncSink) implement this trait. Every
/// method takes `&self` so a sink can be shared between producer tasks
/// and threads behind an `Arc` without any locking on the caller's side.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Filter and persist (or forward) a single record.
    ///
    /// **Returns**
    /// - `Ok(())` if the record was written, queued, or dropped by a
    ///   filter.
    /// - `Err(SinkError::Closed)` if the sink no longer accepts records.
    /// - `Err(SinkError::Store(..))` if an inline write failed. Sinks
    ///   that write in the background never report store errors here.
    async fn fire(&self, record: LogRecord) -> Result<(), SinkError>;

    /// Wait until every record accepted so far has been processed.
    ///
    /// Default implementation is a no-op, which is right for sinks that
    /// write inline.
    async fn flush(&self) {}
}
