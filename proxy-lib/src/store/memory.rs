//! In-memory `Store` adapter used by unit and integration tests in place of
//! a live Redis instance.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use super::{Db, Store};
use crate::error::Result;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<(Db, String), Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, db: Db, key: &str, value: &str, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.data.lock().expect("memory store poisoned").insert((db, key.to_string()), Entry { value: value.to_string(), expires_at });
    }

    pub fn remove(&self, db: Db, key: &str) {
        self.data.lock().expect("memory store poisoned").remove(&(db, key.to_string()));
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, db: Db, key: &str) -> Result<Option<String>> {
        let mut data = self.data.lock().expect("memory store poisoned");
        if let Some(entry) = data.get(&(db, key.to_string())) {
            if entry.expires_at.is_some_and(|at| Instant::now() >= at) {
                data.remove(&(db, key.to_string()));
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn ttl(&self, db: Db, key: &str) -> Result<Option<Duration>> {
        let data = self.data.lock().expect("memory store poisoned");
        Ok(data.get(&(db, key.to_string())).and_then(|e| e.expires_at).map(|at| at.saturating_duration_since(Instant::now())))
    }

    async fn set(&self, db: Db, key: &str, value: &str) -> Result<()> {
        self.put(db, key, value, None);
        Ok(())
    }

    async fn keys(&self, db: Db) -> Result<Vec<String>> {
        let data = self.data.lock().expect("memory store poisoned");
        Ok(data.keys().filter(|(d, _)| *d == db).map(|(_, k)| k.clone()).collect())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut channels = self.channels.lock().expect("memory store poisoned");
        let tx = channels.entry(channel.to_string()).or_insert_with(|| broadcast::channel(64).0).clone();
        let mut rx = tx.subscribe();
        let (out_tx, out_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(payload) = rx.recv().await {
                if out_tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(out_rx)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut channels = self.channels.lock().expect("memory store poisoned");
        let tx = channels.entry(channel.to_string()).or_insert_with(|| broadcast::channel(64).0).clone();
        let _ = tx.send(payload.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = MemoryStore::new();
        store.set(Db::Purchase, "pw1", "{}").await.unwrap();
        assert_eq!(store.get(Db::Purchase, "pw1").await.unwrap(), Some("{}".to_string()));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_missing() {
        let store = MemoryStore::new();
        store.put(Db::Data, "pw1", "5", Some(Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get(Db::Data, "pw1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe("user").await.unwrap();
        store.publish("user", "pw1").await.unwrap();
        assert_eq!(rx.recv().await, Some("pw1".to_string()));
    }
}
