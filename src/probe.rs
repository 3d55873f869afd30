use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::{ProbeRequest, ProbeResult};

/// Default bound on a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Establishes (and immediately drops) one TCP connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> io::Result<()>;
}

/// Waits between attempts. Swapped for a recording fake in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real TCP connects through tokio, bounded by a per-attempt timeout.
///
/// Hostnames go through the system resolver; every resolved address is tried
/// in turn by `TcpStream::connect`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<()> {
        match time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect timed out after {}ms", self.timeout.as_millis()),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        time::sleep(duration).await;
    }
}

/// Bounded retry loop over a single (host, port).
#[derive(Debug, Clone)]
pub struct Probe<C, S> {
    connector: C,
    sleeper: S,
}

impl Probe<TcpConnector, TokioSleeper> {
    pub fn tcp(connect_timeout: Duration) -> Self {
        Self::new(TcpConnector::new(connect_timeout), TokioSleeper)
    }
}

impl<C: Connector, S: Sleeper> Probe<C, S> {
    pub fn new(connector: C, sleeper: S) -> Self {
        Self { connector, sleeper }
    }

    pub async fn check(&self, req: &ProbeRequest) -> ProbeResult {
        self.check_with_cancel(req, &CancellationToken::new()).await
    }

    /// Try to connect up to `req.retries` times (at least once), waiting
    /// `req.interval` between failed attempts. There is no wait after the
    /// final attempt.
    ///
    /// Connection errors of any kind count as one failed attempt. If `cancel`
    /// fires mid-attempt or mid-wait, the port is reported `Unknown`.
    pub async fn check_with_cancel(
        &self,
        req: &ProbeRequest,
        cancel: &CancellationToken,
    ) -> ProbeResult {
        let retries = req.retries.max(1);
        let mut last_error: Option<String> = None;

        for attempt in 1..=retries {
            if cancel.is_cancelled() {
                return ProbeResult::unknown(req.port, attempt - 1, last_error);
            }

            let res = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return ProbeResult::unknown(req.port, attempt, last_error);
                }
                r = self.connector.connect(&req.host, req.port) => r,
            };

            match res {
                Ok(()) => {
                    debug!(host = %req.host, port = req.port, attempt, "port reachable");
                    return ProbeResult::opened(req.port, attempt);
                }
                Err(e) => {
                    debug!(host = %req.host, port = req.port, attempt, error = %e, "connect failed");
                    last_error = Some(e.to_string());
                }
            }

            if attempt < retries {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return ProbeResult::unknown(req.port, attempt, last_error);
                    }
                    _ = self.sleeper.sleep(req.interval) => {}
                }
            }
        }

        ProbeResult::closed(req.port, retries, last_error)
    }
}

/// Plain reachability check of one port over real TCP.
pub async fn check_port(
    host: &str,
    port: u16,
    interval: Duration,
    retries: u32,
    connect_timeout: Duration,
) -> bool {
    let req = ProbeRequest {
        host: host.to_string(),
        port,
        interval,
        retries,
    };
    Probe::tcp(connect_timeout).check(&req).await.reachable()
}
