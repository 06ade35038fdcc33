//! `Store` adapter backed by Redis (grounded: `redis` is used this way in
//! `pks-os-neon`'s proxy crate). Each logical database gets its own
//! connection manager, selected via the database index in the connection
//! URL, since `ConnectionManager` is shared across concurrent callers and
//! cannot safely toggle `SELECT` per call.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;

use super::{Db, Store};
use crate::error::{ProxyError, Result};

pub struct RedisStore {
    purchase: ConnectionManager,
    data: ConnectionManager,
    proxy: ConnectionManager,
    client: Client,
}

impl RedisStore {
    pub async fn connect(base_url: &str, purchase_db: u8, data_db: u8, proxy_db: u8) -> Result<Self> {
        let purchase = Self::manager(base_url, purchase_db).await?;
        let data = Self::manager(base_url, data_db).await?;
        let proxy = Self::manager(base_url, proxy_db).await?;
        let client = Client::open(base_url).map_err(|e| ProxyError::Store(e.to_string()))?;
        Ok(Self { purchase, data, proxy, client })
    }

    async fn manager(base_url: &str, db: u8) -> Result<ConnectionManager> {
        let url = format!("{}/{db}", base_url.trim_end_matches('/'));
        let client = Client::open(url).map_err(|e| ProxyError::Store(e.to_string()))?;
        ConnectionManager::new(client).await.map_err(|e| ProxyError::Store(e.to_string()))
    }

    fn conn(&self, db: Db) -> ConnectionManager {
        match db {
            Db::Purchase => self.purchase.clone(),
            Db::Data => self.data.clone(),
            Db::Proxy => self.proxy.clone(),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, db: Db, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn(db);
        conn.get(key).await.map_err(|e| ProxyError::Store(e.to_string()))
    }

    async fn ttl(&self, db: Db, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.conn(db);
        let secs: i64 = conn.ttl(key).await.map_err(|e| ProxyError::Store(e.to_string()))?;
        Ok(if secs > 0 { Some(Duration::from_secs(secs as u64)) } else { None })
    }

    async fn set(&self, db: Db, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn(db);
        conn.set(key, value).await.map_err(|e| ProxyError::Store(e.to_string()))
    }

    async fn keys(&self, db: Db) -> Result<Vec<String>> {
        let mut conn = self.conn(db);
        conn.keys("*").await.map_err(|e| ProxyError::Store(e.to_string()))
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(|e| ProxyError::Store(e.to_string()))?;
        pubsub.subscribe(channel).await.map_err(|e| ProxyError::Store(e.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else { continue };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.purchase.clone();
        let _: () = conn.publish(channel, payload).await.map_err(|e| ProxyError::Store(e.to_string()))?;
        Ok(())
    }
}
