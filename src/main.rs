use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use telemd::config::ServiceConfig;
use telemd::metrics::{DeviceMetrics, MetricsCollector};
use telemd::server::{
    CounterStore, IpcServer, PeerCredentialPolicy, TelemetryService, TransactionActivityGenerator,
    TrustValidator,
};
use telemd::time::{Clock, SystemClock};

fn config_path() -> anyhow::Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args.next().context("--config requires a path")?;
                path = Some(PathBuf::from(value));
            }
            other => bail!("unknown argument: {other}\nusage: telemd [--config <file.json>]"),
        }
    }
    Ok(path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemd::logging::init("info");

    let config_path = config_path()?;
    let config = ServiceConfig::load(config_path.as_deref()).context("loading service config")?;
    info!(socket = %config.socket_path.display(), "telemd booting");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let shutdown = CancellationToken::new();

    // Telemetry sources
    let collector = Arc::new(MetricsCollector::new(clock.clone()));
    collector.collect();
    let metrics_task = collector.clone().spawn(
        Duration::from_millis(config.metrics_interval_ms),
        shutdown.clone(),
    );

    // Counters + simulated traffic
    let counters = Arc::new(CounterStore::new(clock.clone()));
    let activity_task = TransactionActivityGenerator::new(
        counters.clone(),
        Duration::from_millis(config.activity_interval_ms),
        config.success_rate,
    )
    .spawn(shutdown.clone());

    // Trust boundary
    let server = IpcServer::bind(&config.socket_path, config.socket_mode)
        .with_context(|| format!("binding {}", config.socket_path.display()))?;
    let domain = server.trust_domain().context("reading socket owner")?;

    let mut policy = PeerCredentialPolicy::from_config(&config);
    if config.granted_uids.is_empty() && !config.grant_all_local {
        info!(uid = domain.uid, "no grants configured, granting the service's own uid");
        policy.grant(domain.uid);
    }
    let validator = Arc::new(TrustValidator::new(
        Arc::new(policy),
        clock.clone(),
        config.capability.clone(),
        domain,
        config.trust_ttl_ms,
    ));

    let metrics: Arc<dyn DeviceMetrics> = collector;
    let service = Arc::new(TelemetryService::new(validator, counters, metrics, clock));
    let server_task = tokio::spawn(server.serve(service, shutdown.clone()));

    info!("telemd ready. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown requested");
    shutdown.cancel();

    for (name, task) in [
        ("ipc", server_task),
        ("metrics", metrics_task),
        ("activity", activity_task),
    ] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "task ended abnormally");
        }
    }
    info!("telemd stopped");
    Ok(())
}
