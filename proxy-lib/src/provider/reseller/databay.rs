//! Databay: composes `countryCode-<UPPER>-sessionId-<id>-
//! sessionMaxDuration-<minutes>` on top of a baked-in username prefix.
//! Falls back to the generic tokens shared with Proxyverse when no country
//! or session is requested.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::{compose, rewrite_country};
use crate::provider::{Credentials, Provider};
use crate::error::Result;
use crate::request::{Feature, Protocol, Request, RouteLevel};

const GATE: &str = "resi-global-gateways.databay.com:7676";

#[derive(Debug, Clone)]
pub struct Databay {
    username: Vec<u8>,
    password: Vec<u8>,
    weight: u64,
    protocol: Protocol,
    purchase_id: u64,
}

impl Databay {
    pub fn new(username: Vec<u8>, password: Vec<u8>, weight: u64, protocol: Protocol, purchase_id: u64) -> Self {
        Self { username, password, weight, protocol, purchase_id }
    }

    fn build_username(&self, request: &Request) -> String {
        let base = String::from_utf8_lossy(&self.username).into_owned();
        let suffix = compose(&[
            ("countryCode", rewrite_country(request.country.as_deref(), true)),
            ("sessionId", if request.session_id.is_empty() { None } else { Some(request.session_id.clone()) }),
            (
                "sessionMaxDuration",
                if request.session_duration.as_secs() > 0 {
                    Some((request.session_duration.as_secs() / 60).to_string())
                } else {
                    None
                },
            ),
        ]);
        if suffix.is_empty() {
            base
        } else if base.is_empty() {
            suffix
        } else {
            format!("{base}-{suffix}")
        }
    }
}

#[async_trait]
impl Provider for Databay {
    fn name(&self) -> &str {
        "databay"
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

    fn credentials(&self, request: &Request) -> Result<Credentials> {
        let username = self.build_username(request);
        let payload = format!("{username}:{}", String::from_utf8_lossy(&self.password));
        let encoded = BASE64.encode(payload).into_bytes();
        Ok(Credentials { gate: GATE.to_string(), username: None, password: None, encoded })
    }

    fn purchased_by(&self) -> u64 {
        self.purchase_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    #[test]
    fn composes_uppercase_country_and_minute_duration() {
        let provider = Databay::new(b"base".to_vec(), b"pw".to_vec(), 1, Protocol::Http, 3);
        let mut req = Request::new_for_test(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), "t.test".into());
        req.country = Some("us".into());
        req.session_duration = Duration::from_secs(120);
        let username = provider.build_username(&req);
        assert!(username.contains("countryCode-US"));
        assert!(username.contains("sessionMaxDuration-2"));
    }
}
