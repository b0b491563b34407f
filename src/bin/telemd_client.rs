//! telemd-client: command line front end for the telemetry daemon.
//!
//! Usage:
//!   telemd-client [--socket <path>] [--config <file.json>] <command>
//!
//! Commands:
//!   stats                          one snapshot as JSON
//!   ready                          device readiness (exit 2 when not ready)
//!   reset                          zero the counters
//!   begin                          "start transaction" gate
//!   watch [--interval-ms N] [--count N]
//!                                  repeated snapshots through the rate limiter

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::info;

use telemd::client::{ConnectionManager, Dashboard, StatsCache, TransactionStart, UnixTransport};
use telemd::config::ClientConfig;
use telemd::time::{Clock, SystemClock};

const USAGE: &str = "usage: telemd-client [--socket <path>] [--config <file.json>] \
                     <stats|ready|reset|begin|watch [--interval-ms N] [--count N]>";

#[derive(Debug)]
enum Command {
    Stats,
    Ready,
    Reset,
    Begin,
    Watch { interval_ms: u64, count: Option<u64> },
}

struct Args {
    socket: Option<PathBuf>,
    config: Option<PathBuf>,
    command: Command,
}

fn parse_args() -> anyhow::Result<Args> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let mut socket = None;
    let mut config = None;
    let mut command = None;
    let mut interval_ms = 2_000;
    let mut count = None;

    let mut i = 0;
    while i < argv.len() {
        let value = |i: usize| argv.get(i + 1).cloned().with_context(|| format!("{} requires a value", argv[i]));
        match argv[i].as_str() {
            "--socket" => {
                socket = Some(PathBuf::from(value(i)?));
                i += 1;
            }
            "--config" => {
                config = Some(PathBuf::from(value(i)?));
                i += 1;
            }
            "--interval-ms" | "--interval" => {
                interval_ms = value(i)?.parse().context("--interval-ms expects milliseconds")?;
                i += 1;
            }
            "--count" => {
                count = Some(value(i)?.parse().context("--count expects a number")?);
                i += 1;
            }
            "stats" | "ready" | "reset" | "begin" | "watch" if command.is_none() => {
                command = Some(argv[i].clone());
            }
            other => bail!("unknown argument: {other}\n{USAGE}"),
        }
        i += 1;
    }

    let command = match command.as_deref() {
        Some("stats") => Command::Stats,
        Some("ready") => Command::Ready,
        Some("reset") => Command::Reset,
        Some("begin") => Command::Begin,
        Some("watch") => Command::Watch { interval_ms, count },
        _ => bail!("missing command\n{USAGE}"),
    };
    Ok(Args {
        socket,
        config,
        command,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemd::logging::init("warn");
    let args = parse_args()?;

    let mut config = ClientConfig::load(args.config.as_deref()).context("loading client config")?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let manager = ConnectionManager::new(UnixTransport::from_config(&config));
    let cache = StatsCache::new(manager.clone(), clock, config.min_stats_interval_ms);
    let dashboard = Dashboard::new(manager.clone(), cache);

    dashboard
        .connect()
        .await
        .with_context(|| format!("connecting to {}", config.socket_path.display()))?;

    let outcome = run(&dashboard, &manager, args.command).await;
    manager.disconnect().await;
    let code = outcome?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run(
    dashboard: &Dashboard<UnixTransport>,
    manager: &ConnectionManager<UnixTransport>,
    command: Command,
) -> anyhow::Result<i32> {
    match command {
        Command::Stats => {
            let snapshot = manager.get_current_stats().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Command::Ready => {
            let ready = manager.is_service_ready().await?;
            println!("{}", serde_json::json!({ "ready": ready }));
            if !ready {
                return Ok(2);
            }
        }
        Command::Reset => {
            manager.reset_stats().await?;
            println!("{}", serde_json::json!({ "reset": true }));
        }
        Command::Begin => {
            dashboard.refresh().await;
            if let Some(error) = dashboard.state().error {
                bail!(error);
            }
            let outcome = dashboard.begin_transaction();
            println!("{outcome}");
            if outcome != TransactionStart::Started {
                return Ok(2);
            }
        }
        Command::Watch { interval_ms, count } => {
            let mut cadence = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            let mut printed = 0u64;
            let mut states = manager.subscribe();
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    changed = states.changed() => {
                        if changed.is_err() || !states.borrow_and_update().is_connected() {
                            let state = manager.state();
                            bail!("connection lost: {state:?}");
                        }
                    }
                    _ = cadence.tick() => {
                        dashboard.refresh().await;
                        let state = dashboard.state();
                        if let Some(error) = state.error {
                            bail!(error);
                        }
                        println!("{}", serde_json::to_string(&state.snapshot)?);
                        printed += 1;
                        if count.is_some_and(|n| printed >= n) {
                            break;
                        }
                    }
                }
            }
            info!(printed, "watch finished");
        }
    }
    Ok(0)
}
