use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use port_checker::checker::{self, CheckRequest, CheckResponse};
use port_checker::ports::{load_ports_from_path, parse_ports_str};
use port_checker::probe::DEFAULT_CONNECT_TIMEOUT;
use port_checker::scanner::{ScanOptions, Scanner};
use port_checker::server::{self, AppState};
use port_checker::types::DesiredState;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// port-checker: assert that a host's TCP ports are opened or closed.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "port-checker",
    version,
    about = "Assert that a host's TCP ports are opened or closed, with bounded retries.",
    long_about = None
)]
struct Cli {
    /// Hostname or IP address to check.
    #[arg(long)]
    host: Option<String>,

    /// Ports to check, e.g. `22,80,8000-8010`.
    #[arg(long, value_name = "LIST")]
    ports: Option<String>,

    /// File with more ports (one port, range, or comma list per line).
    #[arg(long = "ports-file")]
    ports_file: Option<PathBuf>,

    /// Expected state of every port.
    #[arg(long, value_enum)]
    state: Option<DesiredState>,

    /// Seconds to wait between attempts on one port [default: 5].
    #[arg(long, allow_negative_numbers = true)]
    interval: Option<i64>,

    /// Connection attempts per port [default: 3].
    #[arg(long, allow_negative_numbers = true)]
    retries: Option<i64>,

    /// Validate the request but do not probe anything.
    #[arg(long = "check-mode", default_value_t = false)]
    check_mode: bool,

    /// Read the request from a JSON file instead of the flags above.
    #[arg(
        long = "args-file",
        conflicts_with_all = ["host", "ports", "ports_file", "state", "interval", "retries"]
    )]
    args_file: Option<PathBuf>,

    /// Timeout for a single connect attempt in milliseconds.
    #[arg(long = "connect-timeout-ms", default_value_t = DEFAULT_CONNECT_TIMEOUT.as_millis() as u64)]
    connect_timeout_ms: u64,

    /// Ports probed at once (1 = strictly in order).
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Give up after this many seconds; unsettled ports are reported unknown.
    #[arg(long = "deadline-secs")]
    deadline_secs: Option<u64>,

    /// Output format on stdout.
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Also write the response as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the check API over HTTP on this address instead of checking once.
    #[arg(long, value_name = "ADDR")]
    serve: Option<String>,

    /// More log output on stderr (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Table,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let options = ScanOptions {
        concurrency: cli.concurrency.max(1),
        deadline: cli.deadline_secs.map(Duration::from_secs),
    };
    let scanner = Scanner::tcp(Duration::from_millis(cli.connect_timeout_ms), options);

    // Ctrl-C cancels the scan; unsettled ports are reported unknown.
    let cancel = CancellationToken::new();
    let cancel_ctrlc = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_ctrlc.cancel();
    });

    if let Some(bind) = cli.serve.as_deref() {
        server::spawn_server(bind, AppState::new(scanner, cancel)).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let req = build_request(&cli)?;
    info!(
        host = %req.host,
        ports = req.ports.len(),
        state = req.state.as_deref().unwrap_or("<none>"),
        "checking ports"
    );

    let (resp, code) = match checker::run_check(&scanner, &req, cancel).await {
        Ok(resp) if resp.failed => (resp, ExitCode::FAILURE),
        Ok(resp) => (resp, ExitCode::SUCCESS),
        Err(e) => {
            error!(error = %e, "invalid request");
            (CheckResponse::invalid(&e), ExitCode::from(2))
        }
    };

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
        OutputFormat::Table => print_response_table(&resp),
    }

    if let Some(path) = cli.output.as_deref() {
        write_response_json(path, &resp)
            .with_context(|| format!("failed to write JSON to {}", path.display()))?;
        info!(path = %path.display(), "wrote JSON response");
    }

    Ok(code)
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

fn build_request(cli: &Cli) -> Result<CheckRequest> {
    if let Some(path) = cli.args_file.as_deref() {
        let file = File::open(path)
            .with_context(|| format!("failed to open args file: {}", path.display()))?;
        let mut req: CheckRequest = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("failed to parse args file: {}", path.display()))?;
        req.check_mode |= cli.check_mode;
        return Ok(req);
    }

    let mut ports: Vec<u16> = Vec::new();
    if let Some(list) = cli.ports.as_deref() {
        ports.extend(parse_ports_str(list).context("invalid --ports")?);
    }
    if let Some(path) = cli.ports_file.as_deref() {
        ports.extend(load_ports_from_path(path)?);
    }

    Ok(CheckRequest {
        host: cli.host.clone().unwrap_or_default(),
        ports: ports.into_iter().map(i64::from).collect(),
        state: cli.state.map(|s| s.to_string()),
        interval: cli.interval,
        retries: cli.retries,
        check_mode: cli.check_mode,
    })
}

fn print_response_table(resp: &CheckResponse) {
    let mode = resp
        .checker_mode
        .map(|m| format!("{m:?}").to_lowercase())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "\nmode: {}  opened: {}  closed: {}  unknown: {}",
        mode,
        resp.checker_status.opened.len(),
        resp.checker_status.closed.len(),
        resp.checker_status.unknown.len()
    );

    if let Some(report) = &resp.report {
        let port_w = 5usize;
        let state_w = 7usize;
        let att_w = "attempts".len();
        println!(
            "{:>port_w$}  {:<state_w$}  {:>att_w$}  {}",
            "port",
            "state",
            "attempts",
            "last_error",
            port_w = port_w,
            state_w = state_w,
            att_w = att_w
        );
        println!(
            "{:-<port_w$}  {:-<state_w$}  {:-<att_w$}  {:-<10}",
            "",
            "",
            "",
            "",
            port_w = port_w,
            state_w = state_w,
            att_w = att_w
        );
        for p in &report.probes {
            let err: String = p
                .last_error
                .as_deref()
                .unwrap_or_default()
                .chars()
                .take(60)
                .collect();
            println!(
                "{:>port_w$}  {:<state_w$}  {:>att_w$}  {}",
                p.port,
                p.state.to_string(),
                p.attempts,
                err,
                port_w = port_w,
                state_w = state_w,
                att_w = att_w
            );
        }
    }

    match (&resp.msg, resp.failed) {
        (Some(msg), true) => println!("\nFAILED: {msg}"),
        _ => println!("\nOK"),
    }
}

fn write_response_json(path: &std::path::Path, resp: &CheckResponse) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, resp)?;
    Ok(())
}
