#![forbid(unsafe_code)]

use std::num::NonZeroUsize;
use std::sync::Arc;

use clap::Parser;
use proxy_lib::accountant::Accountant;
use proxy_lib::authorizer::Authorizer;
use proxy_lib::config::{load_config_file, ConfigFile, ConfigProtocol, GatewayEntry, Settings};
use proxy_lib::mitm::MitmEngine;
use proxy_lib::provider::HttpDialer;
use proxy_lib::proxy::{Pipeline, Server};
use proxy_lib::request::RequestPool;
use proxy_lib::router::Router;
use proxy_lib::session::SessionStore;
use proxy_lib::store::{Db, RedisStore, Store};
use proxy_lib::tracker::Tracker;
use proxy_lib::username::UsernameParser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const MITM_CERT_CACHE_SIZE: usize = 4_096;
const ACCOUNTANT_CHANNEL_BUFFER: usize = 4_096;

#[tokio::main]
async fn main() {
    let settings = Settings::parse();
    init_tracing(settings.effective_log_level());

    let config_file = match &settings.config {
        Some(path) => match load_config_file(path) {
            Ok(file) => Some(file),
            Err(err) => {
                error!(%err, "failed to load config file");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let store: Arc<dyn Store> = match RedisStore::connect(
        &settings.store_url,
        settings.store_purchase_db,
        settings.store_data_db,
        settings.store_proxy_db,
    )
    .await
    {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(%err, "failed to connect to store");
            std::process::exit(1);
        }
    };

    if let Some(file) = &config_file {
        if let Err(err) = seed_gateway_bootstrap(store.as_ref(), file).await {
            error!(%err, "failed to seed gateway bootstrap into store");
            std::process::exit(1);
        }
    }

    let router = Arc::new(Router::new(store.clone()));
    if let Err(err) = router.synchronize().await {
        warn!(error = %err, "initial router sync failed, starting with an empty pool");
    }
    tokio::spawn(router.clone().run_sync_loop(settings.provider_sync_period));

    let authorizer = Arc::new(Authorizer::new(
        store.clone(),
        non_zero(settings.authorization_cache_size),
        settings.authorization_ttl,
    ));
    let invalidation_channel = settings.user_channel.clone();
    let invalidation_authorizer = authorizer.clone();
    tokio::spawn(async move { invalidation_authorizer.listen_invalidations(&invalidation_channel).await });

    let sessions = Arc::new(SessionStore::new(non_zero(settings.session_cache_size)));

    let (zero_threads_tx, mut zero_threads_rx) = mpsc::channel(256);
    tokio::spawn(async move { while zero_threads_rx.recv().await.is_some() {} });
    let tracker = Arc::new(Tracker::new(zero_threads_tx));
    tokio::spawn(listen_restarts(store.clone(), tracker.clone(), settings.restart_channel.clone()));

    let accountant = Arc::new(Accountant::spawn(
        store.clone(),
        settings.activity_channel.clone(),
        settings.accountant_flush_period,
        ACCOUNTANT_CHANNEL_BUFFER,
    ));

    let dialer = HttpDialer::new(settings.proxy_dial_timeout, settings.proxy_read_deadline);
    let username_parser = UsernameParser::new(settings.session_duration, settings.session_duration_max);

    let pipeline = Arc::new(Pipeline {
        authorizer,
        router,
        sessions,
        tracker,
        accountant,
        pool: Arc::new(RequestPool::default()),
        dialer,
        username_parser,
        buffer_size: settings.proxy_buffer_size,
        read_deadline: settings.proxy_read_deadline,
        account_threshold: settings.accountant_bytes,
    });

    let mitm = match build_mitm_engine(&settings) {
        Ok(engine) => engine,
        Err(err) => {
            error!(%err, "failed to initialize MITM engine");
            std::process::exit(1);
        }
    };
    if mitm.is_none() {
        info!("no CA certificate/key configured, CONNECT tunnels will be opaque");
    }

    let server = Arc::new(Server::new(pipeline, mitm));
    if let Err(err) = server.run(settings.addr).await {
        error!(%err, "proxy server exited with error");
        std::process::exit(1);
    }
}

fn build_mitm_engine(settings: &Settings) -> proxy_lib::Result<Option<Arc<MitmEngine>>> {
    let (Some(cert_path), Some(key_path)) = (&settings.cacertfile, &settings.cakeyfile) else {
        return Ok(None);
    };
    let cert_pem = std::fs::read_to_string(cert_path)
        .map_err(|e| proxy_lib::ProxyError::Config(format!("failed to read CA cert file: {e}")))?;
    let key_pem = std::fs::read_to_string(key_path)
        .map_err(|e| proxy_lib::ProxyError::Config(format!("failed to read CA key file: {e}")))?;
    let engine = MitmEngine::new(&cert_pem, &key_pem, non_zero(MITM_CERT_CACHE_SIZE))?;
    Ok(Some(Arc::new(engine)))
}

/// Writes the config file's static/backconnect gateway bootstrap into the
/// `proxy` database in the shape [`Router`]'s sync expects, so a freshly
/// started proxy has a usable pool before any external control plane writes
/// to the store.
async fn seed_gateway_bootstrap(store: &dyn Store, file: &ConfigFile) -> proxy_lib::Result<()> {
    for entry in &file.static_gateways {
        store.set(Db::Proxy, &format!("bootstrap:static:{}", entry.name), &descriptor_json("static", entry)?).await?;
    }
    for entry in &file.backconnect_gateways {
        store
            .set(Db::Proxy, &format!("bootstrap:backconnect:{}", entry.name), &descriptor_json("backconnect", entry)?)
            .await?;
    }
    Ok(())
}

fn descriptor_json(kind: &str, entry: &GatewayEntry) -> proxy_lib::Result<String> {
    let (host, port) = proxy_lib::credentials::split_host_port(&entry.addr)?;
    let protocol = match entry.protocol {
        ConfigProtocol::Http => "http",
        ConfigProtocol::Socks5 => "socks5",
    };
    Ok(serde_json::json!({
        "type": kind,
        "protocol": protocol,
        "username": entry.username,
        "password": entry.password,
        "host": host,
        "port": port.unwrap_or(0),
        "region": entry.region,
    })
    .to_string())
}

/// Subscribes to the restart channel: a
/// password published here means its purchase's cached record changed
/// shape enough that in-flight connections must be force-closed.
async fn listen_restarts(store: Arc<dyn Store>, tracker: Arc<Tracker>, channel: String) {
    let mut rx = match store.subscribe(&channel).await {
        Ok(rx) => rx,
        Err(err) => {
            warn!(error = %err, "failed to subscribe to restart channel");
            return;
        }
    };
    while let Some(password) = rx.recv().await {
        tracker.cancel_by_password(&password);
    }
}

fn non_zero(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"))
}

fn init_tracing(level: Option<&str>) {
    let env_filter = level
        .map(EnvFilter::new)
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();
}
