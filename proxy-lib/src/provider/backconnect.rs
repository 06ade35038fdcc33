//! Backconnect provider: a rotating gateway with baked-in credentials and an
//! optional per-provider region tag. Unlike the original source,
//! which never wires a backconnect branch into the proxy-descriptor decoder,
//! this variant is fully implemented.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::{Credentials, Provider};
use crate::error::Result;
use crate::request::{Feature, Protocol, Request, RouteLevel};

#[derive(Debug, Clone)]
pub struct Backconnect {
    name: String,
    addr: String,
    username: Vec<u8>,
    password: Vec<u8>,
    encoded: Vec<u8>,
    weight: u64,
    protocol: Protocol,
    region: Option<String>,
}

impl Backconnect {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        username: Vec<u8>,
        password: Vec<u8>,
        weight: u64,
        protocol: Protocol,
        region: Option<String>,
    ) -> Self {
        let encoded =
            BASE64.encode(format!("{}:{}", String::from_utf8_lossy(&username), String::from_utf8_lossy(&password)))
                .into_bytes();
        Self { name: name.into(), addr: addr.into(), username, password, encoded, weight, protocol, region }
    }
}

#[async_trait]
impl Provider for Backconnect {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> u64 {
        self.weight
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn has_features(&self, _features: &[Feature]) -> bool {
        false
    }

    fn has_routes(&self, _routes: &[RouteLevel]) -> bool {
        false
    }

    fn has_country(&self, _country: &str) -> bool {
        true
    }

    fn has_region(&self, region: &str) -> bool {
        self.region.as_deref() == Some(region)
    }

    fn has_city(&self, _city: &str) -> bool {
        false
    }

    fn bandwidth_limit(&self) -> i64 {
        -1
    }

    fn credentials(&self, _request: &Request) -> Result<Credentials> {
        Ok(Credentials {
            gate: self.addr.clone(),
            username: Some(self.username.clone()),
            password: Some(self.password.clone()),
            encoded: self.encoded.clone(),
        })
    }

    fn purchased_by(&self) -> u64 {
        0
    }
}
