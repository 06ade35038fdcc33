use std::net::IpAddr;

use http::StatusCode;
use thiserror::Error;

/// Error taxonomy for the proxy pipeline, keyed by kind rather than by
/// originating component so the dispatcher can map a single enum straight
/// to a wire status code.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("missing or invalid Proxy-Authorization header")]
    MissingAuth,
    #[error("purchase not found for password")]
    PurchaseNotFound,
    #[error("purchase has insufficient remaining data")]
    NotEnoughData,
    #[error("client IP not allowed for this purchase")]
    IpNotAllowed,
    #[error("target domain is blocked for this purchase")]
    DomainBlocked,
    #[error("invalid targeting for this purchase")]
    InvalidTargeting,
    #[error("purchase does not support sticky sessions")]
    StickyNotSupported,
    #[error("invalid username parameter")]
    InvalidParam,
    #[error("invalid country code")]
    InvalidCountry,
    #[error("invalid region code")]
    InvalidRegion,
    #[error("purchase has reached its concurrent thread limit")]
    TooManyThreads,
    #[error("failed to select an upstream provider")]
    FailedSelectProvider,
    #[error("upstream gateway dial timed out")]
    GatewayTimeout,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid URI: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error("store error: {0}")]
    Store(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    /// Maps this error to the wire status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MissingAuth | ProxyError::PurchaseNotFound => {
                StatusCode::PROXY_AUTHENTICATION_REQUIRED
            }
            ProxyError::NotEnoughData => StatusCode::PAYMENT_REQUIRED,
            ProxyError::IpNotAllowed | ProxyError::DomainBlocked => StatusCode::FORBIDDEN,
            ProxyError::InvalidTargeting
            | ProxyError::StickyNotSupported
            | ProxyError::InvalidParam
            | ProxyError::InvalidCountry
            | ProxyError::InvalidRegion => StatusCode::BAD_REQUEST,
            ProxyError::TooManyThreads => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::FailedSelectProvider => StatusCode::BAD_GATEWAY,
            ProxyError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Io(_)
            | ProxyError::InvalidUri(_)
            | ProxyError::Store(_)
            | ProxyError::Tls(_)
            | ProxyError::Config(_)
            | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// `Proxy-Authenticate` challenge value required on a 407.
    pub fn challenge(&self) -> Option<&'static str> {
        match self {
            ProxyError::MissingAuth | ProxyError::PurchaseNotFound => Some("Basic realm=\"\""),
            _ => None,
        }
    }
}

/// Context attached to an error for structured logging: provider name,
/// targeting fields, client IP, and password-derived request ID.
#[derive(Debug, Default, Clone)]
pub struct ErrorContext {
    pub request_id: Option<String>,
    pub client_ip: Option<IpAddr>,
    pub provider_name: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

impl ErrorContext {
    pub fn log(&self, err: &ProxyError) {
        tracing::error!(
            error = %err,
            status = err.status_code().as_u16(),
            request_id = self.request_id.as_deref(),
            client_ip = ?self.client_ip,
            provider = self.provider_name.as_deref(),
            country = self.country.as_deref(),
            region = self.region.as_deref(),
            city = self.city.as_deref(),
            "pipeline stage failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(ProxyError::MissingAuth.status_code(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(ProxyError::NotEnoughData.status_code(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(ProxyError::IpNotAllowed.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ProxyError::DomainBlocked.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ProxyError::InvalidTargeting.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(ProxyError::TooManyThreads.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ProxyError::FailedSelectProvider.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ProxyError::GatewayTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn only_auth_errors_carry_a_challenge() {
        assert!(ProxyError::MissingAuth.challenge().is_some());
        assert!(ProxyError::PurchaseNotFound.challenge().is_some());
        assert!(ProxyError::TooManyThreads.challenge().is_none());
    }
}
