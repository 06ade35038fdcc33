//! The MITM Engine. Terminates TLS on an already-hijacked
//! CONNECT socket using a freshly minted, CA-signed leaf certificate, then
//! runs the full Proxy Pipeline against
//! every decrypted inner HTTP request, as if each one were a fresh top-level
//! request.
//!
//! The CONNECT tunnel's own `HTTP/1.1 200 OK` (step 4's first half) is
//! already written by hyper when [`super::accept::Server::handle_connect`]
//! returns its 200 response to complete the upgrade handshake; this engine
//! only needs to wrap the resulting hijacked socket in a TLS server
//! handshake, which is all step 4 asks of it from here.

use std::convert::Infallible;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request as HyperRequest;
use hyper_util::rt::TokioIo;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::request::Canceller;

use super::body::RespBody;
use super::pipeline::Pipeline;
use super::{rewrite, tunnel};
use crate::mitm::cert::CertAuthority;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct MitmEngine {
    authority: CertAuthority,
}

impl MitmEngine {
    pub fn new(cert_pem: &str, key_pem: &str, cache_size: NonZeroUsize) -> crate::error::Result<Self> {
        Ok(Self {
            authority: CertAuthority::load(cert_pem, key_pem, cache_size)?,
        })
    }

    /// Wraps the already-hijacked CONNECT socket in a TLS server handshake
    /// for `host` and serves decrypted requests until the client closes the
    /// stream. Returns whether the session ended cleanly (used for the
    /// outer CONNECT request's tracker/pool bookkeeping).
    pub async fn serve(
        &self,
        io: TokioIo<hyper::upgrade::Upgraded>,
        host: String,
        peer_ip: IpAddr,
        canceller: Canceller,
        pipeline: &Arc<Pipeline>,
    ) -> bool {
        let host_cert = match self.authority.cert_for_host(&host) {
            Ok(cert) => cert,
            Err(err) => {
                warn!(error = %err, %host, "failed to mint MITM leaf certificate");
                return false;
            }
        };

        let mut server_config = match ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(host_cert.chain, host_cert.key)
        {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!(error = %err, %host, "failed to build MITM TLS config");
                return false;
            }
        };
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        let tls_stream = match acceptor.accept(io).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(error = %err, %host, "MITM TLS handshake failed");
                return false;
            }
        };

        let tls_io = TokioIo::new(tls_stream);
        let pipeline = pipeline.clone();
        let host = Arc::new(host);

        let service = service_fn(move |req| {
            let pipeline = pipeline.clone();
            let host = host.clone();
            async move { handle_inner(pipeline, host, peer_ip, req).await }
        });

        let conn = hyper::server::conn::http1::Builder::new()
            .serve_connection(tls_io, service)
            .with_upgrades();
        tokio::pin!(conn);

        loop {
            tokio::select! {
                result = &mut conn => {
                    return match result {
                        Ok(()) => true,
                        Err(err) => {
                            debug!(error = %err, "MITM inner connection ended abnormally");
                            false
                        }
                    };
                }
                _ = tokio::time::sleep(CANCEL_POLL_INTERVAL) => {
                    if canceller.already_fired() {
                        return false;
                    }
                }
            }
        }
    }
}

async fn handle_inner(
    pipeline: Arc<Pipeline>,
    host: Arc<String>,
    peer_ip: IpAddr,
    mut req: HyperRequest<Incoming>,
) -> Result<hyper::Response<RespBody>, Infallible> {
    if req.method() == Method::CONNECT {
        return Ok(handle_inner_connect(pipeline, host, peer_ip, req).await);
    }

    let port = req.uri().port_u16();
    let prepared = match pipeline
        .prepare(peer_ip, req.headers_mut(), host.as_str().to_string(), port)
        .await
    {
        Ok(prepared) => prepared,
        Err(err) => return Ok(pipeline.error_response(err)),
    };

    let purchase_id = prepared.purchase.id;
    let result = rewrite::serve(
        prepared.provider.as_ref(),
        &prepared.request,
        pipeline.dialer.dial_timeout,
        req,
    )
    .await;

    match result {
        Ok(resp) => {
            pipeline.cleanup(prepared.request, purchase_id, false);
            Ok(resp)
        }
        Err(err) => {
            pipeline.cleanup(prepared.request, purchase_id, false);
            Ok(pipeline.error_response(err))
        }
    }
}

/// A CONNECT nested inside an already-MITM'd session is tunneled directly
/// rather than MITM'd again; inner requests still dispatch as if
/// top-level, but MITM interception does not recurse.
async fn handle_inner_connect(
    pipeline: Arc<Pipeline>,
    host: Arc<String>,
    peer_ip: IpAddr,
    mut req: HyperRequest<Incoming>,
) -> hyper::Response<RespBody> {
    let target = match req.uri().authority().map(|a| a.to_string()) {
        Some(authority) => authority,
        None => return pipeline.error_response(crate::error::ProxyError::InvalidParam),
    };
    let (target_host, target_port) = match crate::credentials::split_host_port(&target) {
        Ok(pair) => pair,
        Err(err) => return pipeline.error_response(err),
    };
    let _ = host;

    let prepared = match pipeline
        .prepare(peer_ip, req.headers_mut(), target_host, target_port)
        .await
    {
        Ok(prepared) => prepared,
        Err(err) => return pipeline.error_response(err),
    };

    let target_uri = req.uri().clone();
    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let io = TokioIo::new(upgraded);
                let uri = target_uri.to_string();
                let purchase_id = prepared.purchase.id;
                let closed_cleanly = match prepared.provider.dial(&uri, &prepared.request, &pipeline.dialer).await {
                    Ok(upstream) => {
                        let cfg = tunnel::TunnelConfig {
                            buffer_size: pipeline.buffer_size,
                            read_deadline: pipeline.read_deadline,
                            account_threshold: pipeline.account_threshold,
                        };
                        let outcome = tunnel::run(
                            &cfg,
                            &pipeline.accountant,
                            &prepared.request.password,
                            prepared.request.ip_pin.is_some(),
                            prepared.purchase.bandwidth_limited,
                            io,
                            upstream,
                            prepared.request.canceller(),
                        )
                        .await;
                        matches!(outcome, tunnel::Outcome::Closed)
                    }
                    Err(err) => {
                        warn!(error = %err, "nested MITM tunnel dial failed");
                        false
                    }
                };
                pipeline.cleanup(prepared.request, purchase_id, closed_cleanly);
            }
            Err(err) => {
                warn!(error = %err, "nested CONNECT upgrade failed");
                pipeline.tracker.stop(&prepared.request.id, prepared.purchase.id);
                pipeline.pool.release(prepared.request);
            }
        }
    });

    let mut resp = hyper::Response::new(super::body::empty());
    *resp.status_mut() = http::StatusCode::OK;
    resp
}
