//! Provider Registry & Dialers: the upstream-proxy abstraction and its
//! per-vendor credential composition, plus the shared TCP/CONNECT dialer.

pub mod backconnect;
pub mod dialer;
pub mod reseller;
pub mod static_provider;

use std::fmt;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::error::Result;
use crate::request::{Feature, Protocol, Request, RouteLevel};

pub use backconnect::Backconnect;
pub use dialer::{Dialer, HttpDialer};
pub use reseller::{Databay, DataImpulse, Proxyverse, TtProxy};
pub use static_provider::StaticProvider;

/// `Credentials(Request) → (host:port, username, password, base64(user:pass))`
///. `username`/`password` are `None` for providers that bake
/// everything into the composed Basic-auth payload (the reseller variants).
#[derive(Debug, Clone)]
pub struct Credentials {
    pub gate: String,
    pub username: Option<Vec<u8>>,
    pub password: Option<Vec<u8>>,
    pub encoded: Vec<u8>,
}

/// Sealed provider polymorphism: `Static | Backconnect |
/// Reseller{vendor}`, exposed through one object-safe trait. Credential
/// composition stays vendor-local in each implementation below.
#[async_trait]
pub trait Provider: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn weight(&self) -> u64;
    fn protocol(&self) -> Protocol;
    fn has_features(&self, features: &[Feature]) -> bool;
    fn has_routes(&self, routes: &[RouteLevel]) -> bool;
    fn has_country(&self, country: &str) -> bool;
    fn has_region(&self, region: &str) -> bool;
    fn has_city(&self, city: &str) -> bool;
    /// Negative means "no limit / not tracked at provider level".
    fn bandwidth_limit(&self) -> i64;
    fn credentials(&self, request: &Request) -> Result<Credentials>;
    /// Purchase ID that owns this provider instance; 0 for providers that
    /// are not reseller-owned (static, backconnect).
    fn purchased_by(&self) -> u64;

    async fn dial(&self, uri: &str, request: &Request, dialer: &HttpDialer) -> Result<TcpStream> {
        let creds = self.credentials(request)?;
        dialer.dial(uri, &creds).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    pub(crate) fn test_request() -> Request {
        Request::new_for_test(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), "example.test".into())
    }
}
