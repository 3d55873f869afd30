//! Caller-facing request/response envelope around [`Scanner`].
//!
//! A [`CheckRequest`] carries the raw fields a workflow step supplies. It is
//! validated into a [`ScanRequest`] before any socket is opened, then the
//! scan result is folded into a [`CheckResponse`].
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::InvalidRequest;
use crate::probe::{Connector, Sleeper};
use crate::scanner::Scanner;
use crate::types::{DesiredState, ScanReport, ScanRequest};

pub const DEFAULT_INTERVAL_SECS: i64 = 5;
pub const DEFAULT_RETRIES: i64 = 3;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckRequest {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub ports: Vec<i64>,
    #[serde(default)]
    pub state: Option<String>,
    /// Seconds between attempts on one port.
    #[serde(default)]
    pub interval: Option<i64>,
    /// Attempts per port.
    #[serde(default)]
    pub retries: Option<i64>,
    /// Validate only, never probe.
    #[serde(default, alias = "_ansible_check_mode")]
    pub check_mode: bool,
}

impl CheckRequest {
    /// Reject malformed input field by field, in declaration order.
    pub fn validate(&self) -> Result<ScanRequest, InvalidRequest> {
        let host = validate_host(&self.host)?;

        if self.ports.is_empty() {
            return Err(InvalidRequest::NoPorts);
        }
        let ports = self
            .ports
            .iter()
            .map(|&p| match u16::try_from(p) {
                Ok(port) if port != 0 => Ok(port),
                _ => Err(InvalidRequest::PortOutOfRange(p)),
            })
            .collect::<Result<Vec<u16>, _>>()?;

        let desired_state: DesiredState = self
            .state
            .as_deref()
            .ok_or(InvalidRequest::MissingState)?
            .parse()?;

        let interval = self.interval.unwrap_or(DEFAULT_INTERVAL_SECS);
        let interval = u64::try_from(interval).map_err(|_| InvalidRequest::NegativeInterval(interval))?;

        let retries = self.retries.unwrap_or(DEFAULT_RETRIES);
        let retries = match u32::try_from(retries) {
            Ok(r) if r >= 1 => r,
            _ => return Err(InvalidRequest::InvalidRetries(retries)),
        };

        Ok(ScanRequest {
            host,
            ports,
            desired_state,
            interval: Duration::from_secs(interval),
            retries,
        })
    }
}

/// Accepts IP literals (v6 optionally in brackets) and RFC 1123 style
/// hostnames with an optional trailing dot.
fn validate_host(raw: &str) -> Result<String, InvalidRequest> {
    let host = raw.trim();
    if host.is_empty() {
        return Err(InvalidRequest::EmptyHost);
    }
    let unbracketed = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if unbracketed.parse::<IpAddr>().is_ok() {
        return Ok(unbracketed.to_string());
    }

    let name = host.strip_suffix('.').unwrap_or(host);
    let label_ok = |l: &str| {
        !l.is_empty()
            && l.len() <= 63
            && !l.starts_with('-')
            && !l.ends_with('-')
            && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    };
    if name.len() > 253 || !name.split('.').all(label_ok) {
        return Err(InvalidRequest::MalformedHost(raw.to_string()));
    }
    Ok(host.to_string())
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckerMode {
    Opened,
    Closed,
    Dryrun,
}

impl From<DesiredState> for CheckerMode {
    fn from(s: DesiredState) -> Self {
        match s {
            DesiredState::Opened => CheckerMode::Opened,
            DesiredState::Closed => CheckerMode::Closed,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckerStatus {
    pub opened: Vec<u16>,
    pub closed: Vec<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown: Vec<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CheckResponse {
    /// Always false: checking never mutates the target.
    pub changed: bool,
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checker_mode: Option<CheckerMode>,
    #[serde(default)]
    pub checker_status: CheckerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ScanReport>,
}

impl CheckResponse {
    pub fn dry_run() -> Self {
        Self {
            changed: false,
            failed: false,
            checker_mode: Some(CheckerMode::Dryrun),
            checker_status: CheckerStatus::default(),
            msg: None,
            report: None,
        }
    }

    pub fn invalid(err: &InvalidRequest) -> Self {
        Self {
            changed: false,
            failed: true,
            checker_mode: None,
            checker_status: CheckerStatus::default(),
            msg: Some(err.to_string()),
            report: None,
        }
    }

    pub fn from_report(report: ScanReport) -> Self {
        let msg = report.failure_message();
        Self {
            changed: false,
            failed: msg.is_some(),
            checker_mode: Some(report.desired_state.into()),
            checker_status: CheckerStatus {
                opened: report.opened_ports.clone(),
                closed: report.closed_ports.clone(),
                unknown: report.unknown_ports.clone(),
            },
            msg,
            report: Some(report),
        }
    }
}

/// Validate `req`, then either short-circuit for dry-run or scan.
pub async fn run_check<C, S>(
    scanner: &Scanner<C, S>,
    req: &CheckRequest,
    cancel: CancellationToken,
) -> Result<CheckResponse, InvalidRequest>
where
    C: Connector + 'static,
    S: Sleeper + 'static,
{
    let scan = req.validate()?;
    if req.check_mode {
        info!(host = %scan.host, ports = scan.ports.len(), "check mode, skipping probes");
        return Ok(CheckResponse::dry_run());
    }
    let report = scanner.evaluate_with_cancel(&scan, cancel).await;
    Ok(CheckResponse::from_report(report))
}
