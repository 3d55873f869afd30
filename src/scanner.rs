use crate::probe::{Connector, Probe, Sleeper, TcpConnector, TokioSleeper};
use crate::types::{DesiredState, OverallStatus, PortState, ProbeResult, ScanReport, ScanRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ::time::{format_description::well_known, OffsetDateTime};

/// How a batch is run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    /// Ports probed at once. `1` probes strictly in input order.
    pub concurrency: usize,
    /// Overall budget for the scan; unsettled ports become `Unknown`.
    pub deadline: Option<Duration>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            deadline: None,
        }
    }
}

/// Runs a [`Probe`] across every requested port and judges the result
/// against the desired state.
pub struct Scanner<C, S> {
    probe: Arc<Probe<C, S>>,
    options: ScanOptions,
}

impl Scanner<TcpConnector, TokioSleeper> {
    pub fn tcp(connect_timeout: Duration, options: ScanOptions) -> Self {
        Self::new(Probe::tcp(connect_timeout), options)
    }
}

impl<C, S> Scanner<C, S>
where
    C: Connector + 'static,
    S: Sleeper + 'static,
{
    pub fn new(probe: Probe<C, S>, options: ScanOptions) -> Self {
        Self {
            probe: Arc::new(probe),
            options,
        }
    }

    pub fn options(&self) -> ScanOptions {
        self.options
    }

    pub async fn evaluate(&self, req: &ScanRequest) -> ScanReport {
        self.evaluate_with_cancel(req, CancellationToken::new()).await
    }

    /// Probe every port of `req` and aggregate. `cancel` (or the configured
    /// deadline) aborts in-flight attempts; whatever was not settled by then
    /// is reported as unknown.
    pub async fn evaluate_with_cancel(
        &self,
        req: &ScanRequest,
        cancel: CancellationToken,
    ) -> ScanReport {
        let started_at = now_rfc3339();
        let cancel = cancel.child_token();

        let deadline_task = self.options.deadline.map(|deadline| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                time::sleep(deadline).await;
                warn!(deadline_ms = deadline.as_millis() as u64, "scan deadline reached");
                cancel.cancel();
            })
        });

        let probes = if self.options.concurrency <= 1 {
            self.probe_sequential(req, &cancel).await
        } else {
            self.probe_concurrent(req, &cancel).await
        };

        if let Some(task) = deadline_task {
            task.abort();
        }

        let report = aggregate(req, probes, started_at);
        info!(
            host = %report.host,
            desired = %report.desired_state,
            status = ?report.overall_status,
            opened = report.opened_ports.len(),
            closed = report.closed_ports.len(),
            unknown = report.unknown_ports.len(),
            "port check finished"
        );
        report
    }

    async fn probe_sequential(
        &self,
        req: &ScanRequest,
        cancel: &CancellationToken,
    ) -> Vec<ProbeResult> {
        let mut out = Vec::with_capacity(req.ports.len());
        for &port in &req.ports {
            if cancel.is_cancelled() {
                out.push(ProbeResult::unknown(port, 0, None));
                continue;
            }
            let probe_req = req.probe_request(port);
            out.push(self.probe.check_with_cancel(&probe_req, cancel).await);
        }
        out
    }

    /// Fan out one task per port, bounded by a semaphore. Each task owns the
    /// slot of its port index, so the output keeps input order.
    async fn probe_concurrent(
        &self,
        req: &ScanRequest,
        cancel: &CancellationToken,
    ) -> Vec<ProbeResult> {
        let sem = Arc::new(Semaphore::new(self.options.concurrency.clamp(1, 5_000)));
        let mut set = JoinSet::new();

        for (idx, &port) in req.ports.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                p = sem.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let probe = self.probe.clone();
            let cancel = cancel.clone();
            let probe_req = req.probe_request(port);

            set.spawn(async move {
                let _permit = permit; // keep permit until task completes
                (idx, probe.check_with_cancel(&probe_req, &cancel).await)
            });
        }

        let mut slots: Vec<Option<ProbeResult>> = vec![None; req.ports.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, res)) => slots[idx] = Some(res),
                Err(e) => warn!(error = %e, "probe task failed"),
            }
        }

        slots
            .into_iter()
            .zip(&req.ports)
            .map(|(slot, &port)| slot.unwrap_or_else(|| ProbeResult::unknown(port, 0, None)))
            .collect()
    }
}

/// Classify probe results and apply the decision policy.
///
/// `probes` must be in the order the ports were requested.
pub fn aggregate(req: &ScanRequest, probes: Vec<ProbeResult>, started_at: String) -> ScanReport {
    let mut opened_ports = Vec::new();
    let mut closed_ports = Vec::new();
    let mut unknown_ports = Vec::new();
    for p in &probes {
        match p.state {
            PortState::Opened => opened_ports.push(p.port),
            PortState::Closed => closed_ports.push(p.port),
            PortState::Unknown => unknown_ports.push(p.port),
        }
    }

    let violating_ports = match req.desired_state {
        DesiredState::Opened => closed_ports.clone(),
        DesiredState::Closed => opened_ports.clone(),
    };
    let overall_status = if !violating_ports.is_empty() {
        OverallStatus::Violated
    } else if !unknown_ports.is_empty() {
        OverallStatus::Incomplete
    } else {
        OverallStatus::Satisfied
    };

    ScanReport {
        host: req.host.clone(),
        desired_state: req.desired_state,
        opened_ports,
        closed_ports,
        unknown_ports,
        overall_status,
        violating_ports,
        probes,
        started_at,
        finished_at: now_rfc3339(),
    }
}

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::{RecordingSleeper, ScriptedConnector};

    fn request(ports: &[u16], desired_state: DesiredState) -> ScanRequest {
        ScanRequest {
            host: "127.0.0.1".into(),
            ports: ports.to_vec(),
            desired_state,
            interval: Duration::from_secs(1),
            retries: 2,
        }
    }

    fn scanner(
        conn: ScriptedConnector,
        concurrency: usize,
    ) -> Scanner<ScriptedConnector, RecordingSleeper> {
        Scanner::new(
            Probe::new(conn, RecordingSleeper::default()),
            ScanOptions {
                concurrency,
                deadline: None,
            },
        )
    }

    #[tokio::test]
    async fn all_open_satisfies_opened() {
        let conn = ScriptedConnector::default().open(22).open(80);
        let report = scanner(conn, 1)
            .evaluate(&request(&[22, 80], DesiredState::Opened))
            .await;
        assert_eq!(report.overall_status, OverallStatus::Satisfied);
        assert_eq!(report.opened_ports, vec![22, 80]);
        assert!(report.closed_ports.is_empty());
        assert!(report.violating_ports.is_empty());
        assert_eq!(report.failure_message(), None);
    }

    #[tokio::test]
    async fn closed_port_violates_opened() {
        let conn = ScriptedConnector::default().open(22);
        let report = scanner(conn, 1)
            .evaluate(&request(&[22, 9999], DesiredState::Opened))
            .await;
        assert_eq!(report.overall_status, OverallStatus::Violated);
        assert_eq!(report.closed_ports, vec![9999]);
        assert_eq!(report.violating_ports, vec![9999]);
        assert_eq!(
            report.failure_message().as_deref(),
            Some("specified ports are closed: 9999")
        );
    }

    #[tokio::test]
    async fn open_ports_violate_closed_in_probe_order() {
        let conn = ScriptedConnector::default().open(443).open(22);
        let report = scanner(conn, 1)
            .evaluate(&request(&[443, 9999, 22], DesiredState::Closed))
            .await;
        assert_eq!(report.overall_status, OverallStatus::Violated);
        assert_eq!(report.violating_ports, vec![443, 22]);
        assert_eq!(
            report.failure_message().as_deref(),
            Some("specified ports are opened: 443,22")
        );
    }

    #[tokio::test]
    async fn all_closed_satisfies_closed() {
        let report = scanner(ScriptedConnector::default(), 1)
            .evaluate(&request(&[9999], DesiredState::Closed))
            .await;
        assert!(report.is_satisfied());
        assert!(report.opened_ports.is_empty());
        assert_eq!(report.closed_ports, vec![9999]);
    }

    #[tokio::test]
    async fn duplicates_are_probed_independently() {
        let conn = ScriptedConnector::default().script(80, &[true, false, false]);
        let report = scanner(conn.clone(), 1)
            .evaluate(&request(&[80, 80], DesiredState::Opened))
            .await;
        assert_eq!(report.opened_ports, vec![80]);
        assert_eq!(report.closed_ports, vec![80]);
        assert_eq!(report.probes.len(), 2);
        assert_eq!(conn.attempts_for(80), 3);
    }

    #[tokio::test]
    async fn concurrent_scan_matches_sequential() {
        let ports = [21, 22, 23, 80, 443, 8080, 8443, 9999];
        let conn = || {
            ScriptedConnector::default()
                .open(22)
                .open(443)
                .script(8080, &[false, true])
        };

        let seq = scanner(conn(), 1)
            .evaluate(&request(&ports, DesiredState::Opened))
            .await;
        let par = scanner(conn(), 4)
            .evaluate(&request(&ports, DesiredState::Opened))
            .await;

        assert_eq!(seq.opened_ports, vec![22, 443, 8080]);
        assert_eq!(par.opened_ports, seq.opened_ports);
        assert_eq!(par.closed_ports, seq.closed_ports);
        assert_eq!(par.violating_ports, seq.violating_ports);
        let order: Vec<u16> = par.probes.iter().map(|p| p.port).collect();
        assert_eq!(order, ports.to_vec());
    }

    #[tokio::test]
    async fn cancelled_scan_reports_unknown_not_closed() {
        let conn = ScriptedConnector::default().open(22);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = scanner(conn, 1)
            .evaluate_with_cancel(&request(&[22, 80], DesiredState::Closed), cancel)
            .await;
        assert_eq!(report.unknown_ports, vec![22, 80]);
        assert!(report.closed_ports.is_empty());
        assert_eq!(report.overall_status, OverallStatus::Incomplete);
        assert_eq!(
            report.failure_message().as_deref(),
            Some("port check did not complete for: 22,80")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_marks_remaining_ports_unknown() {
        let conn = ScriptedConnector::default().open(22);
        let scanner = Scanner::new(
            Probe::new(conn, TokioSleeper),
            ScanOptions {
                concurrency: 1,
                deadline: Some(Duration::from_secs(3)),
            },
        );
        let mut req = request(&[22, 9999, 80], DesiredState::Opened);
        req.interval = Duration::from_secs(5);
        req.retries = 3;

        let report = scanner.evaluate(&req).await;
        assert_eq!(report.opened_ports, vec![22]);
        assert_eq!(report.unknown_ports, vec![9999, 80]);
        assert!(report.closed_ports.is_empty());
        assert_eq!(report.overall_status, OverallStatus::Incomplete);
    }

    #[test]
    fn aggregate_partitions_every_probe() {
        let req = request(&[1, 2, 3, 2], DesiredState::Opened);
        let probes = vec![
            ProbeResult::opened(1, 1),
            ProbeResult::closed(2, 2, None),
            ProbeResult::unknown(3, 0, None),
            ProbeResult::opened(2, 1),
        ];
        let report = aggregate(&req, probes, "t0".into());
        let mut all: Vec<u16> = report
            .opened_ports
            .iter()
            .chain(&report.closed_ports)
            .chain(&report.unknown_ports)
            .copied()
            .collect();
        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 2, 3]);
        assert_eq!(report.overall_status, OverallStatus::Violated);
        assert_eq!(
            report.failure_message().as_deref(),
            Some("specified ports are closed: 2; not checked: 3")
        );
    }
}
