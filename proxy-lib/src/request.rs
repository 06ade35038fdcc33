//! The in-flight transaction record and its object pool.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::provider::Provider;
use crate::purchase::PurchaseKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Socks5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteLevel {
    Continent,
    Country,
    Region,
    City,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Sticky,
    Rotating,
    SessionDuration,
}

/// The sole fine-grained cancellation signal for a request:
/// single-producer, single-consumer, buffer of exactly 1, idempotent send.
#[derive(Clone)]
pub struct Canceller {
    sent: Arc<AtomicBool>,
    tx: mpsc::Sender<()>,
}

impl Canceller {
    /// Sends the cancellation signal exactly once; subsequent calls are a
    /// no-op, matching `Stop`'s "exactly one cancellation signal" contract.
    pub fn fire(&self) {
        if !self.sent.swap(true, Ordering::SeqCst) {
            let _ = self.tx.try_send(());
        }
    }

    pub fn already_fired(&self) -> bool {
        self.sent.load(Ordering::SeqCst)
    }
}

pub struct CancelWatch {
    rx: mpsc::Receiver<()>,
}

impl CancelWatch {
    pub async fn cancelled(&mut self) {
        let _ = self.rx.recv().await;
    }

    pub fn try_cancelled(&mut self) -> bool {
        matches!(self.rx.try_recv(), Ok(()))
    }
}

pub fn new_cancel_pair() -> (Canceller, CancelWatch) {
    let (tx, rx) = mpsc::channel(1);
    (Canceller { sent: Arc::new(AtomicBool::new(false)), tx }, CancelWatch { rx })
}

/// Per in-flight transaction.
pub struct Request {
    pub id: String,
    pub user_ip: IpAddr,
    pub target_host: String,
    pub target_port: Option<u16>,
    pub protocol: Protocol,

    pub continent: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub ip_pin: Option<IpAddr>,

    pub session_id: String,
    pub session_duration: Duration,
    pub routes: HashSet<RouteLevel>,
    pub features: HashSet<Feature>,

    pub provider: Option<Arc<dyn Provider>>,
    pub purchase_id: u64,
    pub purchase_kind: Option<PurchaseKind>,
    pub password: String,

    written: AtomicU64,
    pub created_at: Instant,

    cancel_tx: Canceller,
    cancel_rx: Option<CancelWatch>,
}

impl Request {
    fn empty(user_ip: IpAddr, target_host: String) -> Self {
        let (cancel_tx, cancel_rx) = new_cancel_pair();
        Self {
            id: String::new(),
            user_ip,
            target_host,
            target_port: None,
            protocol: Protocol::Http,
            continent: None,
            country: None,
            region: None,
            city: None,
            ip_pin: None,
            session_id: String::new(),
            session_duration: Duration::ZERO,
            routes: HashSet::new(),
            features: HashSet::new(),
            provider: None,
            purchase_id: 0,
            purchase_kind: None,
            password: String::new(),
            written: AtomicU64::new(0),
            created_at: Instant::now(),
            cancel_tx,
            cancel_rx: Some(cancel_rx),
        }
    }

    #[cfg(test)]
    pub fn new_for_test(user_ip: IpAddr, target_host: String) -> Self {
        Self::empty(user_ip, target_host)
    }

    /// Generates the request ID as `password:uuid-v4`.
    pub fn assign_id(&mut self, password: &str) {
        self.password = password.to_string();
        self.id = format!("{password}:{}", Uuid::new_v4());
    }

    pub fn inc(&self, bytes: u64) -> u64 {
        self.written.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn canceller(&self) -> Canceller {
        self.cancel_tx.clone()
    }

    /// Takes ownership of the cancel watcher; only one consumer may hold it
    /// per request lifetime (the copy loop, or the pipeline's own select).
    pub fn take_cancel_watch(&mut self) -> CancelWatch {
        self.cancel_rx.take().expect("cancel watch already taken")
    }

    /// Resets all fields for reuse from the pool. The completion signal is
    /// fired (closed) exactly once here before a fresh pair is created.
    fn reset(&mut self, user_ip: IpAddr, target_host: String) {
        self.cancel_tx.fire();
        let (cancel_tx, cancel_rx) = new_cancel_pair();
        *self = Request { cancel_tx, cancel_rx: Some(cancel_rx), ..Self::empty(user_ip, target_host) };
    }
}

/// Simple synchronous object pool mirroring an acquire-reset-release
/// lifecycle, avoiding a fresh allocation per request.
pub struct RequestPool {
    free: Mutex<Vec<Request>>,
}

impl Default for RequestPool {
    fn default() -> Self {
        Self { free: Mutex::new(Vec::new()) }
    }
}

impl RequestPool {
    pub fn acquire(&self, user_ip: IpAddr, target_host: String) -> Request {
        let mut free = self.free.lock().expect("request pool poisoned");
        match free.pop() {
            Some(mut req) => {
                req.reset(user_ip, target_host);
                req
            }
            None => Request::empty(user_ip, target_host),
        }
    }

    pub fn release(&self, mut req: Request) {
        req.cancel_tx.fire();
        let mut free = self.free.lock().expect("request pool poisoned");
        free.push(req);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn cancel_fires_exactly_once() {
        let (tx, mut rx) = new_cancel_pair();
        tx.fire();
        tx.fire();
        assert!(rx.try_cancelled());
        assert!(!rx.try_cancelled());
    }

    #[test]
    fn pool_reuses_and_resets() {
        let pool = RequestPool::default();
        let ip = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
        let mut req = pool.acquire(ip, "a.test".into());
        req.assign_id("pw1");
        let first_id = req.id.clone();
        pool.release(req);

        let req2 = pool.acquire(ip, "b.test".into());
        assert_ne!(req2.id, first_id);
        assert_eq!(req2.target_host, "b.test");
    }
}
