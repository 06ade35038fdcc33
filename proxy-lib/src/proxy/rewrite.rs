//! Rewrite-serve: non-CONNECT requests are re-issued
//! to the provider's gate as a plain proxied HTTP/1.1 request and the
//! response streamed straight back.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use http::header::PROXY_AUTHORIZATION;
use http::HeaderValue;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::Request as HyperRequest;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::error::{ProxyError, Result};
use crate::provider::{Credentials, Provider};
use crate::request::Request;

use super::body::RespBody;

/// Issues `outbound` to `provider`'s gate and returns the upstream response
/// with its body boxed for uniform streaming back to the client.
pub async fn serve(
    provider: &dyn Provider,
    request: &Request,
    dial_timeout: Duration,
    mut outbound: HyperRequest<Incoming>,
) -> Result<hyper::Response<RespBody>> {
    let creds = provider.credentials(request)?;

    set_proxy_authorization(&mut outbound, &creds)?;

    let socket = tokio::time::timeout(dial_timeout, TcpStream::connect(&creds.gate))
        .await
        .map_err(|_| ProxyError::GatewayTimeout)?
        .map_err(|_| ProxyError::GatewayTimeout)?;

    let io = TokioIo::new(socket);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|_| ProxyError::GatewayTimeout)?;

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::warn!(error = %err, "rewrite-serve upstream connection error");
        }
    });

    let response =
        sender.send_request(outbound).await.map_err(|_| ProxyError::GatewayTimeout)?;

    let (parts, body) = response.into_parts();
    let body = body.map_err(hyper::Error::from).boxed();
    Ok(hyper::Response::from_parts(parts, body))
}

fn set_proxy_authorization(outbound: &mut HyperRequest<Incoming>, creds: &Credentials) -> Result<()> {
    let value = if let (Some(user), Some(pass)) = (&creds.username, &creds.password) {
        if user.is_empty() && pass.is_empty() {
            return Ok(());
        }
        BASE64.encode(format!("{}:{}", String::from_utf8_lossy(user), String::from_utf8_lossy(pass)))
    } else if !creds.encoded.is_empty() {
        String::from_utf8_lossy(&creds.encoded).into_owned()
    } else {
        return Ok(());
    };

    let header = HeaderValue::from_str(&format!("Basic {value}"))
        .map_err(|e| ProxyError::Internal(e.to_string()))?;
    outbound.headers_mut().insert(PROXY_AUTHORIZATION, header);
    Ok(())
}
