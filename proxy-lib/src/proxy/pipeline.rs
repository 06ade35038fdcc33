//! Proxy Pipeline: states 1-8, shared verbatim between a
//! top-level request and an inner MITM request. States 9-12 (dispatch,
//! tunnel/rewrite/mitm-serve, cleanup) live in [`super::tunnel`],
//! [`super::rewrite`], [`super::accept`] and [`crate::mitm`].

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, Response, StatusCode};
use hyper::header::HeaderValue;
use tracing::warn;

use crate::access::check_access;
use crate::accountant::Accountant;
use crate::authorizer::Authorizer;
use crate::credentials;
use crate::error::{ProxyError, Result};
use crate::provider::{HttpDialer, Provider};
use crate::purchase::Purchase;
use crate::request::{Request, RequestPool};
use crate::router::Router;
use crate::session::SessionStore;
use crate::tracker::Tracker;

use super::body::{empty, RespBody};

/// Everything states 1-8 produce: the assembled transaction record, its
/// selected provider, and the purchase record access-checks were run
/// against (still needed by the tunnel's bandwidth-accounting decision).
pub struct Prepared {
    pub request: Request,
    pub provider: Arc<dyn Provider>,
    pub purchase: Purchase,
}

pub struct Pipeline {
    pub authorizer: Arc<Authorizer>,
    pub router: Arc<Router>,
    pub sessions: Arc<SessionStore>,
    pub tracker: Arc<Tracker>,
    pub accountant: Arc<Accountant>,
    pub pool: Arc<RequestPool>,
    pub dialer: HttpDialer,
    pub username_parser: crate::username::UsernameParser,
    pub buffer_size: usize,
    pub read_deadline: Duration,
    pub account_threshold: u64,
}

impl Pipeline {
    /// Runs states 1-8 against `headers`. On any failure the Request (if
    /// already acquired from the pool) is released and any thread
    /// reservation is rolled back: the tracker is always stopped before the
    /// pooled Request is released back.
    pub async fn prepare(
        &self,
        peer_ip: IpAddr,
        headers: &mut HeaderMap,
        target_host: String,
        target_port: Option<u16>,
    ) -> Result<Prepared> {
        // 1. Parse-creds.
        let creds = credentials::extract(headers)?;

        // 3. Parse-username.
        let parsed = self.username_parser.parse(&creds.username, &creds.password)?;

        // 4. Clean-headers.
        credentials::strip_proxy_headers(headers);

        // 5. Authenticate.
        let purchase = self.authorizer.authorize(&creds.password).await?;

        let mut request = self.pool.acquire(peer_ip, target_host);
        request.target_port = target_port;
        request.assign_id(&creds.password);
        request.purchase_id = parsed.purchase_id;
        request.purchase_kind = Some(purchase.kind);
        request.country = parsed.country;
        request.region = parsed.region;
        request.city = parsed.city;
        request.ip_pin = parsed.ip_pin;
        request.session_id = parsed.session_id;
        request.session_duration = parsed.session_duration;
        request.routes = parsed.routes;
        request.features = parsed.features;

        // 6. Access-check.
        if let Err(err) = check_access(&purchase, &request) {
            self.pool.release(request);
            return Err(err);
        }

        // 7. Reserve-thread.
        let count = self.tracker.watch(&request.id, purchase.id, request.canceller());
        if purchase.has_thread_limit() && count as i64 > purchase.threads {
            self.tracker.stop(&request.id, purchase.id);
            self.pool.release(request);
            return Err(ProxyError::TooManyThreads);
        }

        // 8. Select-provider.
        let sticky = !request.session_id.is_empty();
        let provider = if sticky {
            match self.sessions.cached(&request) {
                Some(provider) => provider,
                None => match self.router.route(&purchase, &request) {
                    Ok(provider) => {
                        self.sessions.start(&request, provider.clone());
                        provider
                    }
                    Err(err) => {
                        self.tracker.stop(&request.id, purchase.id);
                        self.pool.release(request);
                        return Err(err);
                    }
                },
            }
        } else {
            match self.router.route(&purchase, &request) {
                Ok(provider) => provider,
                Err(err) => {
                    self.tracker.stop(&request.id, purchase.id);
                    self.pool.release(request);
                    return Err(err);
                }
            }
        };

        request.provider = Some(provider.clone());
        Ok(Prepared { request, provider, purchase })
    }

    /// State 12 (cleanup): maps the tunnel outcome to `Stop`/`Delete` and
    /// always releases the request. For non-tunnel paths (rewrite-serve,
    /// and prepare() failures) there is no "connection closed" signal to
    /// distinguish, so those call sites always report `Stop`.
    pub fn cleanup(&self, request: Request, purchase_id: u64, closed_cleanly: bool) {
        if closed_cleanly {
            self.tracker.delete(&request.id, purchase_id);
        } else {
            self.tracker.stop(&request.id, purchase_id);
        }
        self.pool.release(request);
    }

    /// Maps a pipeline-stage error to the wire response.
    pub fn error_response(&self, err: ProxyError) -> Response<RespBody> {
        warn!(error = %err, "pipeline stage failed");
        let mut builder = Response::builder().status(err.status_code());
        if let Some(challenge) = err.challenge() {
            builder = builder.header(http::header::PROXY_AUTHENTICATE, HeaderValue::from_static(challenge));
        }
        builder.body(empty()).unwrap_or_else(|_| {
            let mut resp = Response::new(empty());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        })
    }
}
