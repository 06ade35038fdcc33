//! Router — weighted round-robin. Keyed by purchase type
//! rather than free-form criteria; the GCD-weighted path in [`wrr`] is
//! retained but never reached from [`Router::route`].

pub mod wrr;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::Rng;
use serde::Deserialize;
use tracing::{debug, error, warn};

use crate::error::{ProxyError, Result};
use crate::provider::{Backconnect, DataImpulse, Databay, Provider, Proxyverse, StaticProvider, TtProxy};
use crate::purchase::{Purchase, PurchaseKind};
use crate::request::{Protocol, Request};
use crate::store::{Db, Store};

/// Wire shape for entries in the `proxy` database, pinned
/// to `router/wrr.go`'s `Proxy` struct field names.
#[derive(Debug, Deserialize)]
struct ProxyDescriptor {
    #[serde(rename = "type")]
    kind: String,
    protocol: String,
    username: String,
    password: String,
    host: String,
    port: u16,
    #[serde(default)]
    purchase_id: u64,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    reseller: Option<String>,
}

#[derive(Default)]
struct State {
    ip_static: Vec<Arc<dyn Provider>>,
    ip_backconnect: Vec<Arc<dyn Provider>>,
    reseller: Vec<Arc<dyn Provider>>,
}

pub struct Router {
    store: Arc<dyn Store>,
    state: ArcSwap<State>,
    /// Per-purchase next-index cursor for the reseller round-robin; reset
    /// on each sync tick along with the reseller slice itself.
    reseller_cursor: Mutex<HashMap<u64, usize>>,
}

impl Router {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, state: ArcSwap::from_pointee(State::default()), reseller_cursor: Mutex::new(HashMap::new()) }
    }

    /// Runs the periodic synchronization loop; intended to be spawned as a
    /// background task and to run until the process exits. A failed tick
    /// logs and is retried next period rather than aborting the loop.
    pub async fn run_sync_loop(self: Arc<Self>, sync_period: Duration) {
        let mut ticker = tokio::time::interval(sync_period);
        loop {
            ticker.tick().await;
            if let Err(err) = self.synchronize().await {
                error!(error = %err, "router sync failed");
            }
        }
    }

    pub async fn synchronize(&self) -> Result<()> {
        let keys = self.store.keys(Db::Proxy).await?;

        let mut ip_static = Vec::new();
        let mut ip_backconnect = Vec::new();
        let mut reseller = Vec::new();

        for key in keys {
            let raw = match self.store.get(Db::Proxy, &key).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to fetch proxy descriptor");
                    continue;
                }
            };

            let descriptor: ProxyDescriptor = match serde_json::from_str(&raw) {
                Ok(d) => d,
                Err(err) => {
                    warn!(key = %key, error = %err, "failed to parse proxy descriptor");
                    continue;
                }
            };

            match descriptor_to_provider(&descriptor) {
                Ok(provider) => match descriptor.kind.as_str() {
                    "static" => ip_static.push(provider),
                    "backconnect" => ip_backconnect.push(provider),
                    "provider" => reseller.push(provider),
                    other => warn!(kind = other, "unsupported proxy type"),
                },
                Err(err) => warn!(key = %key, error = %err, "failed to build provider"),
            }
        }

        debug!(static_count = ip_static.len(), backconnect_count = ip_backconnect.len(), reseller_count = reseller.len(), "router sync done");

        self.state.store(Arc::new(State { ip_static, ip_backconnect, reseller }));
        self.reseller_cursor.lock().expect("router poisoned").clear();
        Ok(())
    }

    /// Dispatches by purchase type: `static`/`backconnect` pick
    /// uniformly at random; `provider` round-robins within the subset owned
    /// by this purchase.
    pub fn route(&self, purchase: &Purchase, _request: &Request) -> Result<Arc<dyn Provider>> {
        let state = self.state.load();
        match purchase.kind {
            PurchaseKind::Static => pick_uniform(&state.ip_static),
            PurchaseKind::Backconnect => pick_uniform(&state.ip_backconnect),
            PurchaseKind::Provider => self.pick_reseller(&state.reseller, purchase.id),
            PurchaseKind::Subnet | PurchaseKind::IspPool => Err(ProxyError::FailedSelectProvider),
        }
    }

    fn pick_reseller(&self, pool: &[Arc<dyn Provider>], purchase_id: u64) -> Result<Arc<dyn Provider>> {
        let owned: Vec<&Arc<dyn Provider>> = pool.iter().filter(|p| p.purchased_by() == purchase_id).collect();
        if owned.is_empty() {
            return Err(ProxyError::FailedSelectProvider);
        }

        let mut cursor = self.reseller_cursor.lock().expect("router poisoned");
        let next = cursor.entry(purchase_id).or_insert(0);
        let chosen = owned[*next % owned.len()].clone();
        *next = (*next + 1) % owned.len();
        Ok(chosen)
    }
}

fn pick_uniform(pool: &[Arc<dyn Provider>]) -> Result<Arc<dyn Provider>> {
    if pool.is_empty() {
        return Err(ProxyError::FailedSelectProvider);
    }
    let index = rand::rng().random_range(0..pool.len());
    Ok(pool[index].clone())
}

fn parse_protocol(raw: &str) -> Protocol {
    if raw.eq_ignore_ascii_case("socks5") {
        Protocol::Socks5
    } else {
        Protocol::Http
    }
}

fn descriptor_to_provider(desc: &ProxyDescriptor) -> Result<Arc<dyn Provider>> {
    let protocol = parse_protocol(&desc.protocol);
    match desc.kind.as_str() {
        "static" => Ok(Arc::new(StaticProvider::new(
            desc.host.clone(),
            format!("{}:{}", desc.host, desc.port),
            desc.username.clone().into_bytes(),
            desc.password.clone().into_bytes(),
            1,
            protocol,
        ))),
        "backconnect" => Ok(Arc::new(Backconnect::new(
            desc.host.clone(),
            format!("{}:{}", desc.host, desc.port),
            desc.username.clone().into_bytes(),
            desc.password.clone().into_bytes(),
            1,
            protocol,
            desc.region.clone(),
        ))),
        "provider" => match desc.reseller.as_deref() {
            Some("ttproxy") => Ok(Arc::new(TtProxy::new(
                desc.username.clone().into_bytes(),
                desc.password.clone().into_bytes(),
                1,
                protocol,
                desc.purchase_id,
            ))),
            Some("dataimpulse") => Ok(Arc::new(DataImpulse::new(
                desc.username.clone().into_bytes(),
                desc.password.clone().into_bytes(),
                1,
                protocol,
                desc.purchase_id,
            ))),
            Some("proxyverse") => {
                Ok(Arc::new(Proxyverse::new(desc.password.clone().into_bytes(), 1, protocol, desc.purchase_id)))
            }
            Some("databay") => Ok(Arc::new(Databay::new(
                desc.username.clone().into_bytes(),
                desc.password.clone().into_bytes(),
                1,
                protocol,
                desc.purchase_id,
            ))),
            other => Err(ProxyError::Config(format!("unknown reseller {other:?}"))),
        },
        other => Err(ProxyError::Config(format!("unknown proxy type {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use crate::store::MemoryStore;

    fn test_request() -> Request {
        Request::new_for_test(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), "example.test".into())
    }

    fn purchase(kind: PurchaseKind, id: u64) -> Purchase {
        Purchase {
            id,
            kind,
            threads: 0,
            ips: Default::default(),
            country_targeting: false,
            sticky: false,
            bandwidth_limited: false,
            expire_at: None,
            blocked_domains: None,
        }
    }

    #[tokio::test]
    async fn synchronize_buckets_by_type() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(Db::Proxy, "p1", r#"{"type":"static","protocol":"http","username":"u","password":"p","host":"1.2.3.4","port":8080}"#)
            .await
            .unwrap();
        store
            .set(
                Db::Proxy,
                "p2",
                r#"{"type":"provider","protocol":"http","username":"","password":"pw","host":"","port":0,"purchase_id":9,"reseller":"dataimpulse"}"#,
            )
            .await
            .unwrap();

        let router = Router::new(store);
        router.synchronize().await.unwrap();

        let state = router.state.load();
        assert_eq!(state.ip_static.len(), 1);
        assert_eq!(state.reseller.len(), 1);
    }

    #[tokio::test]
    async fn empty_static_pool_fails_selection() {
        let router = Router::new(Arc::new(MemoryStore::new()));
        let err = router.route(&purchase(PurchaseKind::Static, 1), &test_request()).unwrap_err();
        assert!(matches!(err, ProxyError::FailedSelectProvider));
    }

    #[tokio::test]
    async fn reseller_round_robins_within_purchase() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                Db::Proxy,
                "a",
                r#"{"type":"provider","protocol":"http","username":"","password":"a","host":"","port":0,"purchase_id":5,"reseller":"dataimpulse"}"#,
            )
            .await
            .unwrap();
        store
            .set(
                Db::Proxy,
                "b",
                r#"{"type":"provider","protocol":"http","username":"","password":"b","host":"","port":0,"purchase_id":5,"reseller":"ttproxy"}"#,
            )
            .await
            .unwrap();

        let router = Router::new(store);
        router.synchronize().await.unwrap();

        let p = purchase(PurchaseKind::Provider, 5);
        let req = test_request();
        let first = router.route(&p, &req).unwrap().name().to_string();
        let second = router.route(&p, &req).unwrap().name().to_string();
        assert_ne!(first, second);
    }
}
