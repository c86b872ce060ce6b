use crate::record::LogRecord;
use async_trait::async_trait;

/// Errors reported by a [`LogStore`] or one of its transactions.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("can't open transaction: {0}")]
    Begin(String),

    #[error("can't insert record: {0}")]
    Insert(String),

    #[error("can't commit transaction: {0}")]
    Commit(String),

    #[error("can't serialize record fields: {0}")]
    Serialize(#[from] serde_json::Error),

    #[cfg(feature = "postgres")]
    #[error("postgres: {0}")]
    Database(#[from] sqlx::Error),
}

/// Transactional destination for [`LogRecord`]s.
///
/// A store persists one row per record with the columns `level`,
/// `message`, `message_data` (the fields as JSON) and `created_at`.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Open a transaction. Rows inserted through it become visible only
    /// once [`LogTransaction::commit`] succeeds.
    async fn begin(&self) -> Result<Box<dyn LogTransaction>, StoreError>;

    /// Insert a single record outside of any explicit transaction.
    async fn insert(&self, record: &LogRecord) -> Result<(), StoreError>;
}

/// An open transaction against a [`LogStore`].
///
/// Dropping a transaction without committing discards its rows.
#[async_trait]
pub trait LogTransaction: Send {
    /// Stage `record` inside the transaction.
    ///
    /// A failed insert must not invalidate rows staged before or after
    /// it; implementations isolate each row when the backend would
    /// otherwise abort the whole transaction.
    async fn insert(&mut self, record: &LogRecord) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
