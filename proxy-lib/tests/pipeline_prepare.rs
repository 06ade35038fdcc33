//! End-to-end exercise of Proxy Pipeline states 1-8 against an in-memory
//! store, standing in for the redis-backed control plane.

use std::net::{IpAddr, Ipv4Addr};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::HeaderMap;

use proxy_lib::accountant::Accountant;
use proxy_lib::authorizer::Authorizer;
use proxy_lib::provider::HttpDialer;
use proxy_lib::proxy::Pipeline;
use proxy_lib::request::RequestPool;
use proxy_lib::router::Router;
use proxy_lib::session::SessionStore;
use proxy_lib::store::{Db, MemoryStore, Store};
use proxy_lib::tracker::Tracker;
use proxy_lib::username::UsernameParser;
use proxy_lib::ProxyError;

fn cap(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap()
}

async fn build_pipeline(store: Arc<MemoryStore>) -> (Pipeline, tokio::sync::mpsc::Receiver<u64>) {
    let router = Arc::new(Router::new(store.clone()));
    router.synchronize().await.unwrap();

    let (zero_tx, zero_rx) = tokio::sync::mpsc::channel(8);
    let pipeline = Pipeline {
        authorizer: Arc::new(Authorizer::new(store.clone(), cap(64), Duration::from_secs(60))),
        router,
        sessions: Arc::new(SessionStore::new(cap(64))),
        tracker: Arc::new(Tracker::new(zero_tx)),
        accountant: Arc::new(Accountant::spawn(store.clone(), "activity".into(), Duration::from_secs(5), 64)),
        pool: Arc::new(RequestPool::default()),
        dialer: HttpDialer::new(Duration::from_secs(5), Duration::from_secs(5)),
        username_parser: UsernameParser::new(Duration::from_secs(60), Duration::from_secs(3600)),
        buffer_size: 4096,
        read_deadline: Duration::from_secs(30),
        account_threshold: 1_048_576,
    };
    (pipeline, zero_rx)
}

fn basic_auth_headers(username: &str, password: &str) -> HeaderMap {
    let encoded = BASE64.encode(format!("{username}:{password}"));
    let mut headers = HeaderMap::new();
    headers.insert("proxy-authorization", format!("Basic {encoded}").parse().unwrap());
    headers
}

#[tokio::test]
async fn prepare_selects_the_synced_static_provider() {
    let store = Arc::new(MemoryStore::new());
    store.set(Db::Purchase, "secret", r#"{"id":1,"type":"static","threads":0}"#).await.unwrap();
    store
        .set(
            Db::Proxy,
            "gw1",
            r#"{"type":"static","protocol":"http","username":"u","password":"p","host":"203.0.113.5","port":8080}"#,
        )
        .await
        .unwrap();

    let (pipeline, _zero_rx) = build_pipeline(store).await;
    let mut headers = basic_auth_headers("profile-product-cat-1", "secret");

    let prepared = pipeline
        .prepare(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)), &mut headers, "example.test".into(), None)
        .await
        .unwrap();

    assert_eq!(prepared.provider.name(), "203.0.113.5");
    assert_eq!(prepared.purchase.id, 1);
    assert!(!headers.contains_key("proxy-authorization"));

    pipeline.cleanup(prepared.request, prepared.purchase.id, true);
}

#[tokio::test]
async fn prepare_rejects_unknown_password() {
    let store = Arc::new(MemoryStore::new());
    let (pipeline, _zero_rx) = build_pipeline(store).await;
    let mut headers = basic_auth_headers("profile-product-cat-1", "nope");

    let err = pipeline
        .prepare(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)), &mut headers, "example.test".into(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ProxyError::PurchaseNotFound));
}

#[tokio::test]
async fn prepare_fails_selection_when_pool_is_empty() {
    let store = Arc::new(MemoryStore::new());
    store.set(Db::Purchase, "secret", r#"{"id":1,"type":"static","threads":0}"#).await.unwrap();
    let (pipeline, _zero_rx) = build_pipeline(store).await;
    let mut headers = basic_auth_headers("profile-product-cat-1", "secret");

    let err = pipeline
        .prepare(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)), &mut headers, "example.test".into(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, ProxyError::FailedSelectProvider));
}
