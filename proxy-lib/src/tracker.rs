//! Connection Tracker: two maps under one lock — in-flight
//! requests and per-purchase thread counts — plus cancellation fan-out and
//! the zero-threads sink.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use crate::request::Canceller;

struct State {
    requests: HashMap<String, (u64, Canceller)>,
    threads: HashMap<u64, u64>,
}

pub struct Tracker {
    state: Mutex<State>,
    zero_threads: mpsc::Sender<u64>,
}

impl Tracker {
    pub fn new(zero_threads: mpsc::Sender<u64>) -> Self {
        Self { state: Mutex::new(State { requests: HashMap::new(), threads: HashMap::new() }), zero_threads }
    }

    /// Registers `request_id` against `purchase_id`, incrementing and
    /// returning its new thread count. The caller enforces the cap.
    pub fn watch(&self, request_id: &str, purchase_id: u64, canceller: Canceller) -> u64 {
        let mut state = self.state.lock().expect("tracker poisoned");
        state.requests.insert(request_id.to_string(), (purchase_id, canceller));
        let count = state.threads.entry(purchase_id).or_insert(0);
        *count += 1;
        *count
    }

    /// Removes the request entry, fires exactly one cancellation signal,
    /// and decrements the purchase counter. Returns the new count.
    pub fn stop(&self, request_id: &str, purchase_id: u64) -> u64 {
        let (count, fire) = {
            let mut state = self.state.lock().expect("tracker poisoned");
            let fire = state.requests.remove(request_id).map(|(_, c)| c);
            let count = decrement(&mut state.threads, purchase_id);
            (count, fire)
        };
        if let Some(canceller) = fire {
            canceller.fire();
        }
        if count == 0 {
            let _ = self.zero_threads.try_send(purchase_id);
            debug!(purchase_id, "purchase thread count reached zero");
        }
        count
    }

    /// Silent variant: removes the request entry without signalling.
    pub fn delete(&self, request_id: &str, purchase_id: u64) -> u64 {
        let count = {
            let mut state = self.state.lock().expect("tracker poisoned");
            state.requests.remove(request_id);
            decrement(&mut state.threads, purchase_id)
        };
        if count == 0 {
            let _ = self.zero_threads.try_send(purchase_id);
        }
        count
    }

    pub fn threads(&self) -> HashMap<u64, u64> {
        self.state.lock().expect("tracker poisoned").threads.clone()
    }

    /// Cancels every in-flight request whose ID begins with `<password>:`.
    pub fn cancel_by_password(&self, password: &str) {
        let prefix = format!("{password}:");
        let state = self.state.lock().expect("tracker poisoned");
        for (id, (_, canceller)) in state.requests.iter() {
            if id.starts_with(&prefix) {
                canceller.fire();
            }
        }
    }
}

fn decrement(threads: &mut HashMap<u64, u64>, purchase_id: u64) -> u64 {
    match threads.get_mut(&purchase_id) {
        Some(count) if *count > 1 => {
            *count -= 1;
            *count
        }
        Some(_) => {
            threads.remove(&purchase_id);
            0
        }
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::new_cancel_pair;

    fn tracker() -> (Tracker, mpsc::Receiver<u64>) {
        let (tx, rx) = mpsc::channel(8);
        (Tracker::new(tx), rx)
    }

    #[test]
    fn watch_increments_and_stop_decrements() {
        let (tracker, _rx) = tracker();
        let (c1, _w1) = new_cancel_pair();
        let (c2, _w2) = new_cancel_pair();
        assert_eq!(tracker.watch("r1", 9, c1), 1);
        assert_eq!(tracker.watch("r2", 9, c2), 2);
        assert_eq!(tracker.stop("r1", 9), 1);
    }

    #[test]
    fn stop_fires_cancellation_exactly_once() {
        let (tracker, _rx) = tracker();
        let (canceller, mut watch) = new_cancel_pair();
        tracker.watch("r1", 1, canceller);
        tracker.stop("r1", 1);
        assert!(watch.try_cancelled());
    }

    #[test]
    fn delete_does_not_signal() {
        let (tracker, _rx) = tracker();
        let (canceller, mut watch) = new_cancel_pair();
        tracker.watch("r1", 1, canceller);
        tracker.delete("r1", 1);
        assert!(!watch.try_cancelled());
    }

    #[tokio::test]
    async fn reaching_zero_emits_on_sink() {
        let (tracker, mut rx) = tracker();
        let (canceller, _watch) = new_cancel_pair();
        tracker.watch("r1", 42, canceller);
        tracker.stop("r1", 42);
        assert_eq!(rx.recv().await, Some(42));
    }

    #[test]
    fn cancel_by_password_matches_prefix_only() {
        let (tracker, _rx) = tracker();
        let (c1, mut w1) = new_cancel_pair();
        let (c2, mut w2) = new_cancel_pair();
        tracker.watch("secret:uuid-1", 1, c1);
        tracker.watch("other:uuid-2", 1, c2);
        tracker.cancel_by_password("secret");
        assert!(w1.try_cancelled());
        assert!(!w2.try_cancelled());
    }
}
