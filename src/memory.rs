use crate::record::LogRecord;
use crate::store::{LogStore, LogTransaction, StoreError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type InsertFault = Arc<dyn Fn(&LogRecord) -> bool + Send + Sync>;

/// A row persisted by [`MemoryStore`], with its generated primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: u64,
    pub record: LogRecord,
}

#[derive(Default)]
struct State {
    rows: Vec<StoredRow>,
    next_id: u64,
    begun: u64,
    committed: u64,
    failing_begins: usize,
    failing_commits: usize,
    insert_fault: Option<InsertFault>,
}

impl State {
    fn persist(&mut self, record: LogRecord) {
        self.next_id += 1;
        self.rows.push(StoredRow { id: self.next_id, record });
    }

    fn check_insert(&self, record: &LogRecord) -> Result<(), StoreError> {
        match &self.insert_fault {
            Some(fault) if fault(record) => {
                Err(StoreError::Insert(format!("rejected record {:?}", record.message)))
            }
            _ => Ok(()),
        }
    }
}

/// In-process [`LogStore`] with real commit semantics.
///
/// Rows staged in a transaction only show up in [`MemoryStore::rows`]
/// after a successful commit. Failures can be injected for begin, insert
/// and commit, which makes it the store of choice for tests and demos.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every committed row, in commit order.
    pub fn rows(&self) -> Vec<StoredRow> {
        self.lock().rows.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn transactions_begun(&self) -> u64 {
        self.lock().begun
    }

    pub fn transactions_committed(&self) -> u64 {
        self.lock().committed
    }

    /// Reject every insert whose record matches `predicate`.
    pub fn fail_inserts_where<F>(&self, predicate: F)
    where
        F: Fn(&LogRecord) -> bool + Send + Sync + 'static,
    {
        self.lock().insert_fault = Some(Arc::new(predicate));
    }

    /// Make the next `count` calls to `begin` fail.
    pub fn fail_next_begins(&self, count: usize) {
        self.lock().failing_begins = count;
    }

    /// Make the next `count` commits fail, discarding their rows.
    pub fn fail_next_commits(&self, count: usize) {
        self.lock().failing_commits = count;
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn LogTransaction>, StoreError> {
        let mut state = self.lock();
        if state.failing_begins > 0 {
            state.failing_begins -= 1;
            return Err(StoreError::Begin("memory store unavailable".to_string()));
        }
        state.begun += 1;

        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
        }))
    }

    async fn insert(&self, record: &LogRecord) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.check_insert(record)?;
        state.persist(record.clone());
        Ok(())
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<State>>,
    staged: Vec<LogRecord>,
}

#[async_trait]
impl LogTransaction for MemoryTransaction {
    async fn insert(&mut self, record: &LogRecord) -> Result<(), StoreError> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check_insert(record)?;
        self.staged.push(record.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { state, staged } = *self;
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(StoreError::Commit("memory store rejected commit".to_string()));
        }

        for record in staged {
            state.persist(record);
        }
        state.committed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Level;

    #[tokio::test]
    async fn rows_appear_only_after_commit() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(&LogRecord::new(Level::Info, "staged")).await.unwrap();
        assert!(store.is_empty());

        tx.commit().await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.rows()[0].id, 1);
        assert_eq!(store.transactions_committed(), 1);
    }

    #[tokio::test]
    async fn dropped_transaction_discards_rows() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert(&LogRecord::new(Level::Info, "lost")).await.unwrap();
        }
        assert!(store.is_empty());
        assert_eq!(store.transactions_begun(), 1);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_begins(1);
        assert!(matches!(store.begin().await, Err(StoreError::Begin(_))));
        assert!(store.begin().await.is_ok());

        store.fail_next_commits(1);
        let mut tx = store.begin().await.unwrap();
        tx.insert(&LogRecord::new(Level::Info, "doomed")).await.unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::Commit(_))));
        assert!(store.is_empty());
    }
}
