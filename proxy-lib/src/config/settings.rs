//! CLI / environment / TOML configuration surface.
//!
//! `Settings` is the `clap` surface: every wire-level timeout/cache/store
//! flag plus the ambient flags (`--config`, `--log-level`). `ConfigFile` is the
//! optional TOML document loaded from `--config`, carrying per-vendor
//! reseller credentials and the static/backconnect gateway pool bootstrap
//! that the CLI has no ergonomic way to express as flags.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::error::{ProxyError, Result};
use crate::request::Protocol;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Authenticating HTTP/HTTPS forward proxy")]
pub struct Settings {
    /// Listen address for plain HTTP/CONNECT.
    #[arg(long, env = "ADDR", default_value = "0.0.0.0:8080")]
    pub addr: SocketAddr,

    /// PEM path to the CA certificate enabling MITM. Omit to force blind tunneling.
    #[arg(long, env = "CACERTFILE")]
    pub cacertfile: Option<PathBuf>,

    /// PEM path (PKCS#8) to the CA private key enabling MITM.
    #[arg(long, env = "CAKEYFILE")]
    pub cakeyfile: Option<PathBuf>,

    /// Sugar for `--log-level=debug`.
    #[arg(long, env = "DEBUG")]
    pub debug: bool,

    /// Overrides the effective log level; falls back to RUST_LOG, then "info".
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,

    #[arg(long, env = "HTTP_READ_TIMEOUT", default_value = "30", value_parser = parse_secs)]
    pub http_read_timeout: Duration,
    #[arg(long, env = "HTTP_WRITE_TIMEOUT", default_value = "30", value_parser = parse_secs)]
    pub http_write_timeout: Duration,
    #[arg(long, env = "HTTP_IDLE_TIMEOUT", default_value = "120", value_parser = parse_secs)]
    pub http_idle_timeout: Duration,

    #[arg(long, env = "PROXY_BUFFER_SIZE", default_value_t = 4096)]
    pub proxy_buffer_size: usize,
    #[arg(long, env = "PROXY_READ_DEADLINE", default_value = "30", value_parser = parse_secs)]
    pub proxy_read_deadline: Duration,
    #[arg(long, env = "PROXY_DIAL_TIMEOUT", default_value = "10", value_parser = parse_secs)]
    pub proxy_dial_timeout: Duration,

    #[arg(long, env = "SESSION_CACHE_SIZE", default_value_t = 100_000)]
    pub session_cache_size: usize,
    #[arg(long, env = "SESSION_DURATION", default_value = "60", value_parser = parse_secs)]
    pub session_duration: Duration,
    #[arg(long, env = "SESSION_DURATION_MAX", default_value = "3600", value_parser = parse_secs)]
    pub session_duration_max: Duration,

    #[arg(long, env = "AUTHORIZATION_CACHE_SIZE", default_value_t = 100_000)]
    pub authorization_cache_size: usize,
    #[arg(long, env = "AUTHORIZATION_TTL", default_value = "30", value_parser = parse_secs)]
    pub authorization_ttl: Duration,

    #[arg(long, env = "ACCOUNTANT_BYTES", default_value_t = 1_048_576)]
    pub accountant_bytes: u64,
    /// Accountant flush cadence: the batching worker ticks on a timer as
    /// well as a byte threshold.
    #[arg(long, env = "ACCOUNTANT_FLUSH_PERIOD", default_value = "5", value_parser = parse_secs)]
    pub accountant_flush_period: Duration,

    #[arg(long, env = "PROVIDER_SYNC_PERIOD", default_value = "10", value_parser = parse_secs)]
    pub provider_sync_period: Duration,

    /// Base connection URL for the external store (redis://host:port).
    #[arg(long, env = "STORE_URL")]
    pub store_url: String,
    #[arg(long, env = "STORE_PURCHASE_DB", default_value_t = 0)]
    pub store_purchase_db: u8,
    #[arg(long, env = "STORE_DATA_DB", default_value_t = 1)]
    pub store_data_db: u8,
    #[arg(long, env = "STORE_PROXY_DB", default_value_t = 2)]
    pub store_proxy_db: u8,

    #[arg(long, env = "USER_CHANNEL", default_value = "user")]
    pub user_channel: String,
    #[arg(long, env = "DATA_CHANNEL", default_value = "data")]
    pub data_channel: String,
    #[arg(long, env = "ACTIVITY_CHANNEL", default_value = "activity")]
    pub activity_channel: String,
    #[arg(long, env = "RESTART_CHANNEL", default_value = "restart")]
    pub restart_channel: String,

    #[arg(long, env = "DATAIMPULSE_HOST")]
    pub dataimpulse_host: Option<String>,
    #[arg(long, env = "DATAIMPULSE_PORT")]
    pub dataimpulse_port: Option<u16>,
    #[arg(long, env = "DATAIMPULSE_USER")]
    pub dataimpulse_user: Option<String>,
    #[arg(long, env = "DATAIMPULSE_PASS")]
    pub dataimpulse_pass: Option<String>,

    #[arg(long, env = "TTPROXY_HOST")]
    pub ttproxy_host: Option<String>,
    #[arg(long, env = "TTPROXY_PORT")]
    pub ttproxy_port: Option<u16>,
    #[arg(long, env = "TTPROXY_USER")]
    pub ttproxy_user: Option<String>,
    #[arg(long, env = "TTPROXY_PASS")]
    pub ttproxy_pass: Option<String>,

    #[arg(long, env = "PROXYVERSE_HOST")]
    pub proxyverse_host: Option<String>,
    #[arg(long, env = "PROXYVERSE_PORT")]
    pub proxyverse_port: Option<u16>,
    #[arg(long, env = "PROXYVERSE_USER")]
    pub proxyverse_user: Option<String>,
    #[arg(long, env = "PROXYVERSE_PASS")]
    pub proxyverse_pass: Option<String>,

    #[arg(long, env = "DATABAY_HOST")]
    pub databay_host: Option<String>,
    #[arg(long, env = "DATABAY_PORT")]
    pub databay_port: Option<u16>,
    #[arg(long, env = "DATABAY_USER")]
    pub databay_user: Option<String>,
    #[arg(long, env = "DATABAY_PASS")]
    pub databay_pass: Option<String>,

    /// Optional TOML file carrying gateway pool bootstrap + vendor credential
    /// overrides, loaded via `load_config_file`.
    #[arg(long, env = "CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl Settings {
    /// Effective tracing filter directive: `--debug` wins over `--log-level`,
    /// which wins over RUST_LOG/default "info" (left to the caller).
    pub fn effective_log_level(&self) -> Option<&str> {
        if self.debug {
            Some("debug")
        } else {
            self.log_level.as_deref()
        }
    }

    pub fn mitm_enabled(&self) -> bool {
        self.cacertfile.is_some() && self.cakeyfile.is_some()
    }
}

fn parse_secs(raw: &str) -> std::result::Result<Duration, String> {
    raw.parse::<u64>().map(Duration::from_secs).map_err(|e| e.to_string())
}

/// A single static or backconnect gateway entry from the bootstrap file.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayEntry {
    pub name: String,
    pub addr: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_weight")]
    pub weight: u64,
    #[serde(default)]
    pub protocol: ConfigProtocol,
    /// Backconnect-only region tag; ignored for static entries.
    #[serde(default)]
    pub region: Option<String>,
}

fn default_weight() -> u64 {
    1
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigProtocol {
    #[default]
    Http,
    Socks5,
}

impl From<ConfigProtocol> for Protocol {
    fn from(p: ConfigProtocol) -> Self {
        match p {
            ConfigProtocol::Http => Protocol::Http,
            ConfigProtocol::Socks5 => Protocol::Socks5,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub static_gateways: Vec<GatewayEntry>,
    #[serde(default)]
    pub backconnect_gateways: Vec<GatewayEntry>,
}

/// Loads and validates the optional `--config` TOML file, following the
/// same read-parse-validate shape used elsewhere for config loading.
pub fn load_config_file<P: AsRef<Path>>(path: P) -> Result<ConfigFile> {
    let txt = fs::read_to_string(path.as_ref())
        .map_err(|e| ProxyError::Config(format!("failed to read config file: {e}")))?;
    let file: ConfigFile = toml::from_str(&txt)
        .map_err(|e| ProxyError::Config(format!("failed to parse config file: {e}")))?;
    validate_config_file(&file)?;
    Ok(file)
}

fn validate_config_file(file: &ConfigFile) -> Result<()> {
    for entry in file.static_gateways.iter().chain(file.backconnect_gateways.iter()) {
        if entry.name.trim().is_empty() {
            return Err(ProxyError::Config("gateway entry missing a name".into()));
        }
        if entry.addr.trim().is_empty() {
            return Err(ProxyError::Config(format!("gateway {} missing an address", entry.name)));
        }
        if entry.weight == 0 {
            return Err(ProxyError::Config(format!("gateway {} has zero weight", entry.name)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_overrides_log_level() {
        let mut settings = Settings::try_parse_from(["proxy", "--store-url", "redis://x"]).unwrap();
        settings.debug = true;
        settings.log_level = Some("warn".into());
        assert_eq!(settings.effective_log_level(), Some("debug"));
    }

    #[test]
    fn mitm_requires_both_cert_and_key() {
        let mut settings = Settings::try_parse_from(["proxy", "--store-url", "redis://x"]).unwrap();
        assert!(!settings.mitm_enabled());
        settings.cacertfile = Some("ca.pem".into());
        assert!(!settings.mitm_enabled());
        settings.cakeyfile = Some("ca.key".into());
        assert!(settings.mitm_enabled());
    }

    #[test]
    fn rejects_zero_weight_gateway() {
        let toml = r#"
            [[static_gateways]]
            name = "gw1"
            addr = "1.2.3.4:8080"
            username = "u"
            password = "p"
            weight = 0
        "#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        assert!(validate_config_file(&file).is_err());
    }

    #[test]
    fn parses_backconnect_entry_with_region() {
        let toml = r#"
            [[backconnect_gateways]]
            name = "bc1"
            addr = "gw.test:9000"
            username = "u"
            password = "p"
            region = "eu"
        "#;
        let file: ConfigFile = toml::from_str(toml).unwrap();
        assert_eq!(file.backconnect_gateways.len(), 1);
        assert_eq!(file.backconnect_gateways[0].region.as_deref(), Some("eu"));
        assert_eq!(file.backconnect_gateways[0].weight, 1);
    }
}
