//! Authorizer: a bounded in-process LRU in front of the
//! external `purchase`/`data` key-value store, with pub/sub invalidation.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::purchase::{Purchase, PurchaseRecord};
use crate::store::{Db, Store};

struct CacheEntry {
    purchase: Purchase,
    expires_at: Instant,
}

pub struct Authorizer {
    store: Arc<dyn Store>,
    cache: Mutex<LruCache<String, CacheEntry>>,
    cache_ttl: Duration,
}

impl Authorizer {
    pub fn new(store: Arc<dyn Store>, cache_size: NonZeroUsize, cache_ttl: Duration) -> Self {
        Self { store, cache: Mutex::new(LruCache::new(cache_size)), cache_ttl }
    }

    pub async fn authorize(&self, password: &str) -> Result<Purchase> {
        if let Some(purchase) = self.cached(password) {
            return Ok(purchase);
        }

        let raw = self.store.get(Db::Purchase, password).await?;
        let Some(raw) = raw else { return Err(ProxyError::PurchaseNotFound) };

        let record: PurchaseRecord =
            serde_json::from_str(&raw).map_err(|e| ProxyError::Store(format!("bad purchase record: {e}")))?;
        let purchase = record.into_purchase();

        if purchase.bandwidth_limited {
            let counter = self.store.get(Db::Data, password).await?;
            match counter.and_then(|v| v.parse::<i64>().ok()) {
                None => return Err(ProxyError::PurchaseNotFound),
                Some(remaining) if remaining <= 0 => return Err(ProxyError::NotEnoughData),
                Some(_) => {}
            }
        }

        let external_ttl = self.store.ttl(Db::Purchase, password).await?;
        let ttl = match external_ttl {
            Some(t) if t < self.cache_ttl => t,
            _ => self.cache_ttl,
        };
        self.cache.lock().expect("authorizer cache poisoned").put(
            password.to_string(),
            CacheEntry { purchase: purchase.clone(), expires_at: Instant::now() + ttl },
        );

        Ok(purchase)
    }

    fn cached(&self, password: &str) -> Option<Purchase> {
        let mut cache = self.cache.lock().expect("authorizer cache poisoned");
        match cache.get(password) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.purchase.clone()),
            Some(_) => {
                cache.pop(password);
                None
            }
            None => None,
        }
    }

    pub fn invalidate(&self, password: &str) {
        self.cache.lock().expect("authorizer cache poisoned").pop(password);
    }

    pub fn purge(&self) {
        self.cache.lock().expect("authorizer cache poisoned").clear();
    }

    /// Subscribes to the invalidation channel for the lifetime of the
    /// process; intended to be spawned as a background task.
    pub async fn listen_invalidations(self: Arc<Self>, channel: &str) {
        let mut rx = match self.store.subscribe(channel).await {
            Ok(rx) => rx,
            Err(err) => {
                warn!(error = %err, "failed to subscribe to invalidation channel");
                return;
            }
        };
        while let Some(password) = rx.recv().await {
            debug!(password = %password, "invalidating cached purchase");
            self.invalidate(&password);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn cap(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test]
    async fn miss_then_not_found() {
        let authorizer = Authorizer::new(Arc::new(MemoryStore::new()), cap(8), Duration::from_secs(60));
        let err = authorizer.authorize("nope").await.unwrap_err();
        assert!(matches!(err, ProxyError::PurchaseNotFound));
    }

    #[tokio::test]
    async fn hit_returns_cached_purchase_without_refetch() {
        let store = Arc::new(MemoryStore::new());
        store.set(Db::Purchase, "pw", r#"{"id":1,"type":"static","threads":0}"#).await.unwrap();
        let authorizer = Authorizer::new(store.clone(), cap(8), Duration::from_secs(60));

        let first = authorizer.authorize("pw").await.unwrap();
        store.remove(Db::Purchase, "pw");
        let second = authorizer.authorize("pw").await.unwrap();

        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn bandwidth_limited_with_no_remaining_is_not_enough_data() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(Db::Purchase, "pw", r#"{"id":1,"type":"static","threads":0,"bandwidth_limited":true}"#)
            .await
            .unwrap();
        store.set(Db::Data, "pw", "0").await.unwrap();
        let authorizer = Authorizer::new(store, cap(8), Duration::from_secs(60));

        let err = authorizer.authorize("pw").await.unwrap_err();
        assert!(matches!(err, ProxyError::NotEnoughData));
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let store = Arc::new(MemoryStore::new());
        store.set(Db::Purchase, "pw", r#"{"id":1,"type":"static","threads":0}"#).await.unwrap();
        let authorizer = Authorizer::new(store.clone(), cap(8), Duration::from_secs(60));

        authorizer.authorize("pw").await.unwrap();
        authorizer.invalidate("pw");
        store.remove(Db::Purchase, "pw");

        let err = authorizer.authorize("pw").await.unwrap_err();
        assert!(matches!(err, ProxyError::PurchaseNotFound));
    }
}
