//! Session Store: TTL-bounded `sessionID -> Provider`
//! pin for sticky sessions, bounded by a configured LRU size.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::provider::Provider;
use crate::request::Request;

struct Entry {
    provider: Arc<dyn Provider>,
    expires_at: Instant,
}

pub struct SessionStore {
    cache: Mutex<LruCache<String, Entry>>,
}

impl SessionStore {
    pub fn new(size: NonZeroUsize) -> Self {
        Self { cache: Mutex::new(LruCache::new(size)) }
    }

    /// Returns the pinned provider if present and not expired.
    pub fn cached(&self, request: &Request) -> Option<Arc<dyn Provider>> {
        if request.session_id.is_empty() {
            return None;
        }
        let mut cache = self.cache.lock().expect("session store poisoned");
        match cache.get(&request.session_id) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.provider.clone()),
            Some(_) => {
                cache.pop(&request.session_id);
                None
            }
            None => None,
        }
    }

    /// Binds `request.session_id -> provider` with an expiry of
    /// `request.session_duration`. Re-starting an unexpired ID is an
    /// idempotent replace.
    pub fn start(&self, request: &Request, provider: Arc<dyn Provider>) {
        if request.session_id.is_empty() {
            return;
        }
        let expires_at = Instant::now() + request.session_duration;
        self.cache.lock().expect("session store poisoned").put(request.session_id.clone(), Entry { provider, expires_at });
    }

    pub fn purge(&self) {
        self.cache.lock().expect("session store poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::thread::sleep;

    use crate::provider::StaticProvider;
    use crate::request::Protocol;

    fn provider() -> Arc<dyn Provider> {
        Arc::new(StaticProvider::new("p", "1.2.3.4:80", b"u".to_vec(), b"p".to_vec(), 1, Protocol::Http))
    }

    fn request_with_session(id: &str, duration: Duration) -> Request {
        let mut req = Request::new_for_test(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), "t.test".into());
        req.session_id = id.to_string();
        req.session_duration = duration;
        req
    }

    #[test]
    fn missing_session_id_is_never_cached() {
        let store = SessionStore::new(NonZeroUsize::new(4).unwrap());
        let req = request_with_session("", Duration::from_secs(60));
        store.start(&req, provider());
        assert!(store.cached(&req).is_none());
    }

    #[test]
    fn start_then_cached_round_trips() {
        let store = SessionStore::new(NonZeroUsize::new(4).unwrap());
        let req = request_with_session("sess1", Duration::from_secs(60));
        store.start(&req, provider());
        assert!(store.cached(&req).is_some());
    }

    #[test]
    fn expired_entry_reads_as_missing() {
        let store = SessionStore::new(NonZeroUsize::new(4).unwrap());
        let req = request_with_session("sess1", Duration::from_millis(1));
        store.start(&req, provider());
        sleep(Duration::from_millis(20));
        assert!(store.cached(&req).is_none());
    }

    #[test]
    fn restart_before_expiry_replaces_binding() {
        let store = SessionStore::new(NonZeroUsize::new(4).unwrap());
        let req = request_with_session("sess1", Duration::from_secs(60));
        store.start(&req, provider());
        store.start(&req, provider());
        assert!(store.cached(&req).is_some());
    }
}
