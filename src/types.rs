use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::InvalidRequest;

/// Reachability the caller asserts for every requested port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Opened,
    Closed,
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesiredState::Opened => write!(f, "opened"),
            DesiredState::Closed => write!(f, "closed"),
        }
    }
}

impl FromStr for DesiredState {
    type Err = InvalidRequest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "opened" => Ok(DesiredState::Opened),
            "closed" => Ok(DesiredState::Closed),
            _ => Err(InvalidRequest::UnsupportedState(s.to_string())),
        }
    }
}

/// Observed state of a single port.
///
/// `Unknown` is only produced when a scan is cancelled or hits its deadline
/// before the port's retry budget was spent.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Opened,
    Closed,
    Unknown,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortState::Opened => write!(f, "opened"),
            PortState::Closed => write!(f, "closed"),
            PortState::Unknown => write!(f, "unknown"),
        }
    }
}

/// One (host, port) probe with its retry budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub host: String,
    pub port: u16,
    pub interval: Duration,
    pub retries: u32,
}

/// Outcome of one probe.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub port: u16,
    pub state: PortState,
    /// Connection attempts actually started.
    pub attempts: u32,
    /// Error of the last failed attempt, for diagnostics only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl ProbeResult {
    pub fn opened(port: u16, attempts: u32) -> Self {
        Self {
            port,
            state: PortState::Opened,
            attempts,
            last_error: None,
        }
    }

    pub fn closed(port: u16, attempts: u32, last_error: Option<String>) -> Self {
        Self {
            port,
            state: PortState::Closed,
            attempts,
            last_error,
        }
    }

    pub fn unknown(port: u16, attempts: u32, last_error: Option<String>) -> Self {
        Self {
            port,
            state: PortState::Unknown,
            attempts,
            last_error,
        }
    }

    pub fn reachable(&self) -> bool {
        self.state == PortState::Opened
    }
}

/// A validated batch check against one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub host: String,
    /// Probed in this order; duplicates are probed again.
    pub ports: Vec<u16>,
    pub desired_state: DesiredState,
    pub interval: Duration,
    pub retries: u32,
}

impl ScanRequest {
    pub fn probe_request(&self, port: u16) -> ProbeRequest {
        ProbeRequest {
            host: self.host.clone(),
            port,
            interval: self.interval,
            retries: self.retries,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Satisfied,
    Violated,
    /// No contradiction was observed but some ports were never settled.
    Incomplete,
}

/// Aggregated result of a scan. Port lists keep probe order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub host: String,
    pub desired_state: DesiredState,
    pub opened_ports: Vec<u16>,
    pub closed_ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown_ports: Vec<u16>,
    pub overall_status: OverallStatus,
    pub violating_ports: Vec<u16>,
    pub probes: Vec<ProbeResult>,
    pub started_at: String,
    pub finished_at: String,
}

impl ScanReport {
    pub fn is_satisfied(&self) -> bool {
        self.overall_status == OverallStatus::Satisfied
    }

    /// Human-readable failure line, `None` when the assertion held.
    pub fn failure_message(&self) -> Option<String> {
        match self.overall_status {
            OverallStatus::Satisfied => None,
            OverallStatus::Violated => {
                let mut msg = format!(
                    "specified ports are {}: {}",
                    // opened assertion fails on closed ports and vice versa
                    match self.desired_state {
                        DesiredState::Opened => "closed",
                        DesiredState::Closed => "opened",
                    },
                    join_ports(&self.violating_ports)
                );
                if !self.unknown_ports.is_empty() {
                    msg.push_str(&format!(
                        "; not checked: {}",
                        join_ports(&self.unknown_ports)
                    ));
                }
                Some(msg)
            }
            OverallStatus::Incomplete => Some(format!(
                "port check did not complete for: {}",
                join_ports(&self.unknown_ports)
            )),
        }
    }
}

/// Comma-join port numbers without spaces, e.g. `22,80,443`.
pub fn join_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
