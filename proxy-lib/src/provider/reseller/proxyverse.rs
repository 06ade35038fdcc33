//! Proxyverse: composes `continent-<v>-country-<xx>-city-<v>-region-<v>-
//! session-<id>-duration-<seconds>` and substitutes `worldwide` for `rr`
//!.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use super::{compose, rewrite_country};
use crate::provider::{Credentials, Provider};
use crate::error::Result;
use crate::request::{Feature, Protocol, Request, RouteLevel};

const GATE: &str = "51.81.93.42:9200";

#[derive(Debug, Clone)]
pub struct Proxyverse {
    password: Vec<u8>,
    weight: u64,
    protocol: Protocol,
    purchase_id: u64,
}

impl Proxyverse {
    pub fn new(password: Vec<u8>, weight: u64, protocol: Protocol, purchase_id: u64) -> Self {
        Self { password, weight, protocol, purchase_id }
    }

    fn build_username(&self, request: &Request) -> String {
        compose(&[
            ("continent", request.continent.clone()),
            ("country", rewrite_country(request.country.as_deref(), false)),
            ("city", request.city.clone()),
            ("region", request.region.clone()),
            ("session", if request.session_id.is_empty() { None } else { Some(request.session_id.clone()) }),
            (
                "duration",
                if request.session_duration.as_secs() > 0 {
                    Some(request.session_duration.as_secs().to_string())
                } else {
                    None
                },
            ),
        ])
    }
}

#[async_trait]
impl Provider for Proxyverse {
    fn name(&self) -> &str {
        "proxyverse"
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

    fn request_with_country(country: &str) -> Request {
        let mut req = Request::new_for_test(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), "t.test".into());
        req.country = Some(country.to_string());
        req
    }

    #[test]
    fn rr_country_becomes_worldwide() {
        let provider = Proxyverse::new(b"pw".to_vec(), 1, Protocol::Http, 7);
        let username = provider.build_username(&request_with_country("rr"));
        assert!(username.contains("country-worldwide"));
    }

    #[test]
    fn normal_country_is_lowercased() {
        let provider = Proxyverse::new(b"pw".to_vec(), 1, Protocol::Http, 7);
        let username = provider.build_username(&request_with_country("US"));
        assert!(username.contains("country-us"));
    }
}
