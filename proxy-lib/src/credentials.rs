//! Credential Extractor & Request Construction: reads the
//! inbound `Proxy-Authorization` header, splits it into username/password,
//! and strips proxy-only headers before the request is forwarded.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::header::{HeaderMap, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};

use crate::error::{ProxyError, Result};

pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

/// Extracts and decodes the `Proxy-Authorization` header. Only the `Basic`
/// scheme is accepted (case-insensitively); the decoded `user:pass` payload
/// is split on the first colon.
pub fn extract(headers: &HeaderMap) -> Result<ProxyCredentials> {
    let raw = headers.get(PROXY_AUTHORIZATION).ok_or(ProxyError::MissingAuth)?;
    let raw = raw.to_str().map_err(|_| ProxyError::MissingAuth)?;
    if raw.is_empty() {
        return Err(ProxyError::MissingAuth);
    }

    let (scheme, payload) = raw.split_once(' ').ok_or(ProxyError::MissingAuth)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(ProxyError::MissingAuth);
    }

    let decoded = BASE64.decode(payload.trim()).map_err(|_| ProxyError::MissingAuth)?;
    let decoded = String::from_utf8(decoded).map_err(|_| ProxyError::MissingAuth)?;
    let (username, password) = decoded.split_once(':').ok_or(ProxyError::MissingAuth)?;

    Ok(ProxyCredentials { username: username.to_string(), password: password.to_string() })
}

/// Splits a `Host` header value into (host, port). Fails the request as
/// bad if the port segment is present but unparseable.
pub fn split_host_port(host_header: &str) -> Result<(String, Option<u16>)> {
    match host_header.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port.parse().map_err(|_| ProxyError::InvalidParam)?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((host_header.to_string(), None)),
    }
}

/// Removes both `Proxy-Authorization` and `Proxy-Authenticate` from the
/// forwarded request; neither should reach the upstream target.
pub fn strip_proxy_headers(headers: &mut HeaderMap) {
    headers.remove(PROXY_AUTHORIZATION);
    headers.remove(PROXY_AUTHENTICATE);
}

/// Builds the `Basic` challenge value returned on `407` responses.
pub fn challenge_header() -> HeaderValue {
    HeaderValue::from_static("Basic realm=\"\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(PROXY_AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn missing_header_is_missing_auth() {
        let err = extract(&HeaderMap::new()).unwrap_err();
        assert!(matches!(err, ProxyError::MissingAuth));
    }

    #[test]
    fn non_basic_scheme_is_rejected() {
        let headers = headers_with_auth("Bearer abcdef");
        let err = extract(&headers).unwrap_err();
        assert!(matches!(err, ProxyError::MissingAuth));
    }

    #[test]
    fn decodes_basic_payload() {
        let encoded = BASE64.encode("acme-wifi-basic-1:supersecret");
        let headers = headers_with_auth(&format!("Basic {encoded}"));
        let creds = extract(&headers).unwrap();
        assert_eq!(creds.username, "acme-wifi-basic-1");
        assert_eq!(creds.password, "supersecret");
    }

    #[test]
    fn password_may_contain_colons() {
        let encoded = BASE64.encode("user:pass:with:colons");
        let headers = headers_with_auth(&format!("Basic {encoded}"));
        let creds = extract(&headers).unwrap();
        assert_eq!(creds.username, "user");
        assert_eq!(creds.password, "pass:with:colons");
    }

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_host_port("example.com:443").unwrap(), ("example.com".to_string(), Some(443)));
        assert_eq!(split_host_port("example.com").unwrap(), ("example.com".to_string(), None));
    }

    #[test]
    fn bad_port_is_rejected() {
        let err = split_host_port("example.com:notaport").unwrap_err();
        assert!(matches!(err, ProxyError::InvalidParam));
    }

    #[test]
    fn strips_both_proxy_headers() {
        let mut headers = headers_with_auth("Basic dGVzdA==");
        headers.insert(PROXY_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"\""));
        strip_proxy_headers(&mut headers);
        assert!(headers.get(PROXY_AUTHORIZATION).is_none());
        assert!(headers.get(PROXY_AUTHENTICATE).is_none());
    }
}
