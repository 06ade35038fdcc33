use std::collections::HashSet;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use serde::Deserialize;

/// Purchase type discriminator: the 5-variant set that the authorization
/// path validates purchases against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseKind {
    Static,
    Backconnect,
    Provider,
    Subnet,
    IspPool,
}

impl PurchaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PurchaseKind::Static => "static",
            PurchaseKind::Backconnect => "backconnect",
            PurchaseKind::Provider => "provider",
            PurchaseKind::Subnet => "subnet",
            PurchaseKind::IspPool => "isp_pool",
        }
    }
}

/// Tenant-scoped authorization record keyed by password.
#[derive(Debug, Clone)]
pub struct Purchase {
    pub id: u64,
    pub kind: PurchaseKind,
    /// `<= 0` means no limit.
    pub threads: i64,
    /// Empty means unrestricted.
    pub ips: HashSet<IpAddr>,
    pub country_targeting: bool,
    pub sticky: bool,
    pub bandwidth_limited: bool,
    pub expire_at: Option<SystemTime>,
    pub blocked_domains: Option<crate::access::DomainTree>,
}

impl Purchase {
    pub fn has_thread_limit(&self) -> bool {
        self.threads > 0
    }
}

/// Wire payload for the `purchase` database.
/// Field names are pinned to `auth/redis_gcache.go`'s JSON shape.
#[derive(Debug, Deserialize)]
pub struct PurchaseRecord {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: PurchaseKind,
    pub threads: i64,
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    #[serde(default)]
    pub bandwidth_limited: bool,
    #[serde(default)]
    pub country_targeting: bool,
    #[serde(default)]
    pub sticky: bool,
    #[serde(default)]
    pub expire_in_secs: Option<u64>,
}

impl PurchaseRecord {
    pub fn into_purchase(self) -> Purchase {
        Purchase {
            id: self.id,
            kind: self.kind,
            threads: self.threads,
            ips: self.ips.into_iter().collect(),
            country_targeting: self.country_targeting,
            sticky: self.sticky,
            bandwidth_limited: self.bandwidth_limited,
            expire_at: self.expire_in_secs.map(|s| SystemTime::now() + Duration::from_secs(s)),
            blocked_domains: None,
        }
    }
}
