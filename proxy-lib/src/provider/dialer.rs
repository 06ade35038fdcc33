//! The HTTP dialer: TCP-connects to a gate and issues an HTTP/1.1 CONNECT to
//! reach the real upstream socket. Grounded on `pkg/dialer/http.go`'s request
//! framing; unlike the original (which stubs out the actual dial), this
//! performs a real connect, writes the CONNECT request, and validates the
//! response status line.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::Credentials;
use crate::error::{ProxyError, Result};
use crate::request::Protocol;

#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    fn protocol(&self) -> Protocol;
    async fn dial(&self, uri: &str, credentials: &Credentials) -> Result<TcpStream>;
}

#[derive(Debug, Clone, Copy)]
pub struct HttpDialer {
    pub dial_timeout: std::time::Duration,
    pub read_deadline: std::time::Duration,
}

impl HttpDialer {
    pub fn new(dial_timeout: std::time::Duration, read_deadline: std::time::Duration) -> Self {
        Self { dial_timeout, read_deadline }
    }
}

#[async_trait::async_trait]
impl Dialer for HttpDialer {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn dial(&self, uri: &str, credentials: &Credentials) -> Result<TcpStream> {
        let mut socket = timeout(self.dial_timeout, TcpStream::connect(&credentials.gate))
            .await
            .map_err(|_| ProxyError::GatewayTimeout)??;

        let mut request = format!("CONNECT {uri} HTTP/1.1\r\n");
        if let (Some(username), Some(password)) = (&credentials.username, &credentials.password) {
            let encoded = BASE64.encode(format!(
                "{}:{}",
                String::from_utf8_lossy(username),
                String::from_utf8_lossy(password)
            ));
            request.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
        } else if !credentials.encoded.is_empty() {
            request.push_str(&format!(
                "Proxy-Authorization: Basic {}\r\n",
                String::from_utf8_lossy(&credentials.encoded)
            ));
        }
        request.push_str("\r\n");

        timeout(self.read_deadline, socket.write_all(request.as_bytes()))
            .await
            .map_err(|_| ProxyError::GatewayTimeout)??;

        let status_line = timeout(self.read_deadline, read_status_line(&mut socket))
            .await
            .map_err(|_| ProxyError::GatewayTimeout)??;

        if !status_line.contains(" 200") {
            return Err(ProxyError::GatewayTimeout);
        }

        Ok(socket)
    }
}

/// Reads byte-by-byte straight off the socket until the header block's
/// terminating blank line, returning only the status line. No buffered
/// reader is used so no bytes are lost once the CONNECT response has been
/// consumed and the socket is handed off for tunneling.
async fn read_status_line(socket: &mut TcpStream) -> Result<String> {
    let mut status_line = Vec::new();
    let mut line = Vec::new();
    let mut first_line_done = false;
    loop {
        let mut byte = [0u8; 1];
        let n = socket.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            if !first_line_done {
                status_line = line.clone();
                first_line_done = true;
            }
            if line == b"\r\n" {
                break;
            }
            line.clear();
        }
    }
    Ok(String::from_utf8_lossy(&status_line).into_owned())
}
