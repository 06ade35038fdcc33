//! External key-value + pub/sub store: three logical databases
//! (`purchase`, `data`, `proxy`) and named invalidation channels. Modeled as
//! a typed port so the pipeline never depends on `redis` directly.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Db {
    Purchase,
    Data,
    Proxy,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, db: Db, key: &str) -> Result<Option<String>>;
    async fn ttl(&self, db: Db, key: &str) -> Result<Option<Duration>>;
    async fn set(&self, db: Db, key: &str, value: &str) -> Result<()>;
    async fn keys(&self, db: Db) -> Result<Vec<String>>;

    /// Subscribes to a named channel; returns a receiver fed by a background
    /// task for the lifetime of the subscription.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
}
