pub mod record;
pub mod filter;
pub mod error;
pub mod store;
pub mod sink;
pub mod sync_sink;
pub mod async_sink;
pub mod layer;

pub mod memory;
pub mod noop_store;

#[cfg(feature = "postgres")]
pub mod postgres;

pub mod backend;
pub mod env;
pub mod init;
