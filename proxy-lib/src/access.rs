//! Access Checker: a pure function of (Purchase, Request).

use std::collections::HashSet;

use crate::error::{ProxyError, Result};
use crate::purchase::{Purchase, PurchaseKind};
use crate::request::Request;

/// Blocked-domain membership test. A domain blocks its subdomains too, so
/// membership is tested suffix-wise on dot-separated labels rather than by
/// exact string match.
#[derive(Debug, Clone, Default)]
pub struct DomainTree {
    blocked: HashSet<String>,
}

impl DomainTree {
    pub fn new(domains: impl IntoIterator<Item = String>) -> Self {
        Self { blocked: domains.into_iter().map(|d| d.to_ascii_lowercase()).collect() }
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        let mut suffix = host.as_str();
        loop {
            if self.blocked.contains(suffix) {
                return true;
            }
            match suffix.find('.') {
                Some(idx) => suffix = &suffix[idx + 1..],
                None => return false,
            }
        }
    }
}

/// Checks whether `request` may proceed against `purchase`: IP allowlist,
/// blocked domains, and targeting compatibility.
pub fn check_access(purchase: &Purchase, request: &Request) -> Result<()> {
    if !purchase.ips.is_empty() && !purchase.ips.contains(&request.user_ip) {
        return Err(ProxyError::IpNotAllowed);
    }

    if !purchase.country_targeting && request.country.is_some() {
        return Err(ProxyError::InvalidTargeting);
    }

    if !purchase.sticky
        && (!request.session_id.is_empty() || request.session_duration.as_secs() != 0)
    {
        return Err(ProxyError::StickyNotSupported);
    }

    if purchase.kind == PurchaseKind::Static
        && (request.country.is_some() || request.region.is_some() || request.city.is_some())
    {
        return Err(ProxyError::InvalidTargeting);
    }

    if let Some(tree) = &purchase.blocked_domains {
        if tree.is_blocked(&request.target_host) {
            return Err(ProxyError::DomainBlocked);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn base_request() -> Request {
        Request::new_for_test(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), "example.test".into())
    }

    fn base_purchase(kind: PurchaseKind) -> Purchase {
        Purchase {
            id: 1,
            kind,
            threads: 0,
            ips: HashSet::new(),
            country_targeting: true,
            sticky: true,
            bandwidth_limited: false,
            expire_at: None,
            blocked_domains: None,
        }
    }

    #[test]
    fn ip_whitelist_rejects_unknown_ip() {
        let mut purchase = base_purchase(PurchaseKind::Provider);
        purchase.ips.insert(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)));
        let err = check_access(&purchase, &base_request()).unwrap_err();
        assert!(matches!(err, ProxyError::IpNotAllowed));
    }

    #[test]
    fn country_targeting_flag_blocks_country() {
        let mut purchase = base_purchase(PurchaseKind::Provider);
        purchase.country_targeting = false;
        let mut request = base_request();
        request.country = Some("us".into());
        let err = check_access(&purchase, &request).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidTargeting));
    }

    #[test]
    fn non_sticky_purchase_rejects_session() {
        let mut purchase = base_purchase(PurchaseKind::Provider);
        purchase.sticky = false;
        let mut request = base_request();
        request.session_id = "123".into();
        let err = check_access(&purchase, &request).unwrap_err();
        assert!(matches!(err, ProxyError::StickyNotSupported));
    }

    #[test]
    fn static_purchase_rejects_any_geo_targeting() {
        let purchase = base_purchase(PurchaseKind::Static);
        let mut request = base_request();
        request.region = Some("ca".into());
        let err = check_access(&purchase, &request).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidTargeting));
    }

    #[test]
    fn blocked_domain_tree_matches_subdomains() {
        let mut purchase = base_purchase(PurchaseKind::Provider);
        purchase.blocked_domains = Some(DomainTree::new(["example.test".to_string()]));
        let mut request = base_request();
        request.target_host = "api.example.test".into();
        let err = check_access(&purchase, &request).unwrap_err();
        assert!(matches!(err, ProxyError::DomainBlocked));
    }

    #[test]
    fn allowed_request_passes() {
        let purchase = base_purchase(PurchaseKind::Provider);
        assert!(check_access(&purchase, &base_request()).is_ok());
    }
}
