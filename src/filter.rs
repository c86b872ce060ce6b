use crate::record::{Level, LogRecord};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// A record transform applied before a record reaches a sink.
///
/// Returning `None` drops the record; returning `Some` passes the
/// (possibly rebuilt) record on to the next filter.
pub type Filter = Arc<dyn Fn(LogRecord) -> Option<LogRecord> + Send + Sync>;

/// Ordered list of [`Filter`]s shared by every sink type.
///
/// Filters run in registration order and the chain stops at the first
/// filter that drops the record.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Arc<RwLock<Vec<Filter>>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a filter to the end of the chain.
    ///
    /// Safe to call while other threads are running records through
    /// [`FilterChain::apply`], and from inside a filter; in-flight records
    /// finish with the chain they started with.
    pub fn add_filter<F>(&self, filter: F)
    where
        F: Fn(LogRecord) -> Option<LogRecord> + Send + Sync + 'static,
    {
        self.filters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(filter));
    }

    /// Run `record` through every filter. `None` means it was dropped.
    pub fn apply(&self, record: LogRecord) -> Option<LogRecord> {
        let filters = self.filters.read().unwrap_or_else(PoisonError::into_inner).clone();
        filters.iter().try_fold(record, |record, filter| filter(record))
    }

    pub fn len(&self) -> usize {
        self.filters.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain").field("filters", &self.len()).finish()
    }
}

/// Drop records less severe than `min`.
pub fn min_level(min: Level) -> impl Fn(LogRecord) -> Option<LogRecord> + Send + Sync + 'static {
    move |record| (record.level >= min).then_some(record)
}

/// Drop records carrying a field named `key`, whatever its value.
pub fn ignore_field(key: impl Into<String>) -> impl Fn(LogRecord) -> Option<LogRecord> + Send + Sync + 'static {
    let key = key.into();
    move |record| (!record.fields.contains_key(&key)).then_some(record)
}

/// Merge constant fields into every record. Fields already present on
/// the record keep their value.
pub fn extra_fields(
    extra: BTreeMap<String, serde_json::Value>,
) -> impl Fn(LogRecord) -> Option<LogRecord> + Send + Sync + 'static {
    move |mut record| {
        for (key, value) in &extra {
            record.fields.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Some(record)
    }
}

/// Strip the named fields before the record is stored.
pub fn remove_fields<I, K>(keys: I) -> impl Fn(LogRecord) -> Option<LogRecord> + Send + Sync + 'static
where
    I: IntoIterator<Item = K>,
    K: Into<String>,
{
    let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
    move |mut record| {
        for key in &keys {
            record.fields.remove(key);
        }
        Some(record)
    }
}
