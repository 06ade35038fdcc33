//! Byte Accountant: a single-producer channel drained by
//! one worker that batches `password,bytes` records and flushes them to the
//! external store's `data` fan-out channel on a tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::store::Store;

#[derive(Debug, Clone)]
pub struct ByteRecord {
    pub password: String,
    pub bytes: u64,
}

#[derive(Clone)]
pub struct Accountant {
    tx: mpsc::Sender<ByteRecord>,
}

impl Accountant {
    /// Spawns the batching worker and returns the handle used to submit
    /// records. `channel` is the store's configured fan-out channel.
    pub fn spawn(store: Arc<dyn Store>, channel: String, period: Duration, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        tokio::spawn(run_worker(store, channel, period, rx));
        Self { tx }
    }

    /// Submitting is a blocking send on the hot path: callers
    /// must not hold critical-section locks while awaiting this.
    pub async fn decrement(&self, password: &str, bytes: u64) {
        if bytes == 0 {
            return;
        }
        if self.tx.send(ByteRecord { password: password.to_string(), bytes }).await.is_err() {
            warn!("accountant worker is gone, dropping byte record");
        }
    }
}

async fn run_worker(store: Arc<dyn Store>, channel: String, period: Duration, mut rx: mpsc::Receiver<ByteRecord>) {
    let mut buffer = String::new();
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            record = rx.recv() => {
                match record {
                    Some(record) => append(&mut buffer, &record),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                flush(&store, &channel, &mut buffer).await;
            }
        }
    }

    flush(&store, &channel, &mut buffer).await;
}

fn append(buffer: &mut String, record: &ByteRecord) {
    if !buffer.is_empty() {
        buffer.push(':');
    }
    buffer.push_str(&record.password);
    buffer.push(',');
    buffer.push_str(&record.bytes.to_string());
}

async fn flush(store: &Arc<dyn Store>, channel: &str, buffer: &mut String) {
    if buffer.is_empty() {
        return;
    }
    if let Err(err) = store.publish(channel, buffer).await {
        error!(error = %err, "failed to publish byte accounting batch");
    }
    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Db, MemoryStore};

    #[tokio::test]
    async fn batches_records_into_colon_separated_pairs() {
        let store = Arc::new(MemoryStore::new());
        let mut rx = store.subscribe("activity").await.unwrap();

        let accountant = Accountant::spawn(store, "activity".to_string(), Duration::from_millis(20), 16);
        accountant.decrement("pw1", 100).await;
        accountant.decrement("pw2", 50).await;

        let batch = rx.recv().await.unwrap();
        assert!(batch.contains("pw1,100"));
        assert!(batch.contains("pw2,50"));
    }

    #[tokio::test]
    async fn zero_bytes_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let accountant = Accountant::spawn(store.clone(), "activity".to_string(), Duration::from_millis(10), 16);
        accountant.decrement("pw1", 0).await;
        assert_eq!(store.get(Db::Data, "unused").await.unwrap(), None);
    }
}
