//! DataImpulse: a reseller gateway with baked-in username/password; unlike
//! Proxyverse/Databay it does not compose per-request targeting tokens
//! (grounded on `pkg/provider/dataimpulse.go`, which ignores the Request
//! entirely).

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::provider::{Credentials, Provider};
use crate::error::Result;
use crate::request::{Feature, Protocol, Request, RouteLevel};

const GATE: &str = "http://gw.dataimpulse.com:823";

#[derive(Debug, Clone)]
pub struct DataImpulse {
    username: Vec<u8>,
    password: Vec<u8>,
    weight: u64,
    protocol: Protocol,
    purchase_id: u64,
}

impl DataImpulse {
    pub fn new(username: Vec<u8>, password: Vec<u8>, weight: u64, protocol: Protocol, purchase_id: u64) -> Self {
        Self { username, password, weight, protocol, purchase_id }
    }
}

#[async_trait]
impl Provider for DataImpulse {
    fn name(&self) -> &str {
        "dataimpulse"
    }

    fn weight(&self) -> u64 {
        self.weight
    }

    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn has_features(&self, _features: &[Feature]) -> bool {
        true
    }

    fn has_routes(&self, _routes: &[RouteLevel]) -> bool {
        true
    }

    fn has_country(&self, _country: &str) -> bool {
        true
    }

    fn has_region(&self, _region: &str) -> bool {
        true
    }

    fn has_city(&self, _city: &str) -> bool {
        true
    }

    fn bandwidth_limit(&self) -> i64 {
        -1
    }

    fn credentials(&self, _request: &Request) -> Result<Credentials> {
        let payload =
            format!("{}:{}", String::from_utf8_lossy(&self.username), String::from_utf8_lossy(&self.password));
        let encoded = BASE64.encode(payload).into_bytes();
        Ok(Credentials { gate: GATE.to_string(), username: None, password: None, encoded })
    }

    fn purchased_by(&self) -> u64 {
        self.purchase_id
    }
}
