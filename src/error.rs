use crate::store::StoreError;

/// Error returned to producers by [`LogSink::fire`](crate::sink::LogSink::fire).
#[derive(thiserror::Error, Debug)]
pub enum SinkError {
    /// The sink was flushed and stopped, or its worker is gone.
    #[error("sink closed")]
    Closed,

    /// The queue is full and the caller runs on a runtime that cannot
    /// block without starving the worker.
    #[error("sink queue full and the current runtime cannot block")]
    WouldBlock,

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
