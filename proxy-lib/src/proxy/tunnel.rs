//! The bidirectional copy loop and its byte-accounting policy. Shared
//! between top-level Tunnel-serve and the MITM engine's inner tunnel path.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::accountant::Accountant;
use crate::request::Canceller;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Both directions ended via cancellation (the client or upstream
    /// closed normally, or the tracker fired a cancellation).
    Closed,
    /// At least one direction ended on a read/write error.
    Abnormal,
}

pub struct TunnelConfig {
    pub buffer_size: usize,
    pub read_deadline: Duration,
    pub account_threshold: u64,
}

/// Runs both copy directions concurrently and combines their outcomes: any
/// direction ending abnormally makes the whole tunnel abnormal.
#[allow(clippy::too_many_arguments)]
pub async fn run<C, U>(
    cfg: &TunnelConfig,
    accountant: &Arc<Accountant>,
    password: &str,
    ip_pinned: bool,
    bandwidth_limited: bool,
    client: C,
    upstream: U,
    canceller: Canceller,
) -> Outcome
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    U: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    // Only the client-to-upstream direction is ever billed (spec: "read
    // from client when request.IP == nil"); upstream-to-client is never
    // accounted regardless of pinning.
    let should_account = !ip_pinned && bandwidth_limited;

    let upload = copy_direction(
        client_read,
        upstream_write,
        canceller.clone(),
        cfg.buffer_size,
        cfg.read_deadline,
        cfg.account_threshold,
        should_account.then(|| (accountant.clone(), password.to_string())),
    );
    let download = copy_direction(
        upstream_read,
        client_write,
        canceller,
        cfg.buffer_size,
        cfg.read_deadline,
        cfg.account_threshold,
        None,
    );

    let (up_outcome, down_outcome) = tokio::join!(upload, download);
    debug!(?up_outcome, ?down_outcome, "tunnel directions finished");

    if up_outcome == Outcome::Abnormal || down_outcome == Outcome::Abnormal {
        Outcome::Abnormal
    } else {
        Outcome::Closed
    }
}

async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    canceller: Canceller,
    buffer_size: usize,
    read_deadline: Duration,
    account_threshold: u64,
    accounting: Option<(Arc<Accountant>, String)>,
) -> Outcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut accounted: u64 = 0;

    loop {
        if canceller.already_fired() {
            let _ = writer.shutdown().await;
            return Outcome::Closed;
        }

        let read = match tokio::time::timeout(read_deadline, reader.read(&mut buf)).await {
            Ok(Ok(0)) => {
                let _ = writer.shutdown().await;
                return Outcome::Closed;
            }
            Ok(Ok(n)) => n,
            Ok(Err(_)) => {
                let _ = writer.shutdown().await;
                return Outcome::Abnormal;
            }
            // Deadline elapsed with no data; loop back and re-check cancellation.
            Err(_) => continue,
        };

        accounted += read as u64;
        if accounted >= account_threshold {
            if let Some((accountant, password)) = &accounting {
                accountant.decrement(password, accounted).await;
            }
            accounted = 0;
        }

        if writer.write_all(&buf[..read]).await.is_err() {
            let _ = writer.shutdown().await;
            return Outcome::Abnormal;
        }
    }
}
