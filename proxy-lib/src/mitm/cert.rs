//! Ephemeral leaf-certificate minting for the MITM engine, signed by an
//! operator-supplied CA. Built on `rcgen`'s certificate-builder API,
//! generalized from self-signed test leaves to CA-signed per-host leaves.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use time::{Duration as TimeDuration, OffsetDateTime};

use crate::error::{ProxyError, Result};

const LEAF_VALIDITY_DAYS: i64 = 10;

/// A signed leaf certificate + private key, ready for `rustls::ServerConfig`.
#[derive(Clone)]
pub struct HostCert {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

/// Holds the CA keypair and mints/caches per-host leaf certificates.
pub struct CertAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    cache: Mutex<LruCache<String, HostCert>>,
}

impl CertAuthority {
    /// Loads a CA certificate and key from PEM files (spec's `--cacertfile`
    /// / `--cakeyfile`).
    pub fn load(cert_pem: &str, key_pem: &str, cache_size: NonZeroUsize) -> Result<Self> {
        let ca_key = KeyPair::from_pem(key_pem)
            .map_err(|e| ProxyError::Tls(format!("failed to parse CA key: {e}")))?;
        let ca_params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| ProxyError::Tls(format!("failed to parse CA certificate: {e}")))?;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| ProxyError::Tls(format!("failed to load CA certificate: {e}")))?;

        Ok(Self {
            ca_cert,
            ca_key,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Returns a cached leaf cert for `host`, minting and caching a fresh
    /// one on a miss.
    pub fn cert_for_host(&self, host: &str) -> Result<HostCert> {
        if let Some(cert) = self.cache.lock().unwrap().get(host) {
            return Ok(cert.clone());
        }

        let cert = self.mint(host)?;
        self.cache.lock().unwrap().put(host.to_string(), cert.clone());
        Ok(cert)
    }

    fn mint(&self, host: &str) -> Result<HostCert> {
        let mut params = if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            let mut params = CertificateParams::new(Vec::new())
                .map_err(|e| ProxyError::Tls(format!("failed to build cert params: {e}")))?;
            params.subject_alt_names.push(SanType::IpAddress(ip));
            params
        } else {
            CertificateParams::new(vec![host.to_string()])
                .map_err(|e| ProxyError::Tls(format!("failed to build cert params: {e}")))?
        };

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages =
            vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + TimeDuration::days(LEAF_VALIDITY_DAYS);

        let leaf_key = KeyPair::generate()
            .map_err(|e| ProxyError::Tls(format!("failed to generate leaf key: {e}")))?;
        let leaf_cert = params
            .signed_by(&leaf_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| ProxyError::Tls(format!("failed to sign leaf cert: {e}")))?;

        Ok(HostCert {
            chain: vec![
                CertificateDer::from(leaf_cert.der().to_vec()),
                CertificateDer::from(self.ca_cert.der().to_vec()),
            ],
            key: PrivateKeyDer::try_from(leaf_key.serialize_der())
                .map_err(|e| ProxyError::Tls(format!("failed to encode leaf key: {e:?}")))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> (String, String) {
        let mut params = CertificateParams::default();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "test MITM CA");
        params.distinguished_name = dn;
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn mints_and_caches_leaf_certificate() {
        let (cert_pem, key_pem) = test_ca();
        let authority = CertAuthority::load(&cert_pem, &key_pem, NonZeroUsize::new(8).unwrap()).unwrap();

        let first = authority.cert_for_host("example.com").unwrap();
        let second = authority.cert_for_host("example.com").unwrap();
        assert_eq!(first.chain[0].as_ref(), second.chain[0].as_ref());
    }

    #[test]
    fn mints_distinct_certificates_per_host() {
        let (cert_pem, key_pem) = test_ca();
        let authority = CertAuthority::load(&cert_pem, &key_pem, NonZeroUsize::new(8).unwrap()).unwrap();

        let a = authority.cert_for_host("a.example.com").unwrap();
        let b = authority.cert_for_host("b.example.com").unwrap();
        assert_ne!(a.chain[0].as_ref(), b.chain[0].as_ref());
    }
}
