use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};
use tracing_ansilog::{
    init::init_tracing,
    record::LogRecord,
    store::{LogStore, LogTransaction, StoreError},
};

/// Example of integrating a completely custom backend by implementing
/// the `LogStore` trait directly. Imagine this talks to some
/// proprietary DB for which this crate does not provide a built-in
/// store.
struct MyCustomDbStore;

struct MyCustomDbTransaction {
    staged: Vec<String>,
}

#[async_trait]
impl LogStore for MyCustomDbStore {
    async fn begin(&self) -> Result<Box<dyn LogTransaction>, StoreError> {
        Ok(Box::new(MyCustomDbTransaction { staged: Vec::new() }))
    }

    async fn insert(&self, record: &LogRecord) -> Result<(), StoreError> {
        println!("[my-custom-db] {} {}", record.level, record.message);
        Ok(())
    }
}

#[async_trait]
impl LogTransaction for MyCustomDbTransaction {
    async fn insert(&mut self, record: &LogRecord) -> Result<(), StoreError> {
        let data = record.fields_json()?;
        self.staged.push(format!("{} {} {}", record.level, record.message, data));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        // Here you would call your own client library for the target DB.
        // For the sake of example we just print the batch.
        for row in &self.staged {
            println!("[my-custom-db] {}", row);
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn LogStore> = Arc::new(MyCustomDbStore);
    let sink = init_tracing(store)?;

    info!("custom backend example started");
    error!(db = "my-custom-db", "simulated error sent via custom backend");

    sink.flush().await;
    Ok(())
}
