mod cli;
mod scenario;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use commons_core::{load_dotenv, EnvProbe, HostProbe, RuntimeFlavor, SchedulerConfig, StaticProbe};
use commons_scheduler::Scheduler;

use crate::cli::CliArgs;
use crate::scenario::Scenario;

fn load_config(args: &CliArgs) -> Result<SchedulerConfig> {
    let Some(path) = &args.config else {
        return SchedulerConfig::from_env().context("invalid scheduler environment");
    };
    match SchedulerConfig::from_file(path) {
        Ok(config) => {
            info!(path = %path.display(), "loaded scheduler config");
            Ok(config)
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %path.display(),
                "failed to load config, using environment"
            );
            SchedulerConfig::from_env().context("invalid scheduler environment")
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let config = load_config(&args)?;

    let probe: Box<dyn HostProbe> = if args.threaded_regions {
        Box::new(StaticProbe(RuntimeFlavor::Regionized))
    } else {
        Box::new(EnvProbe)
    };
    let scheduler =
        Arc::new(Scheduler::new(config, probe.as_ref()).context("failed to start scheduler")?);

    let scenario = Scenario::setup(&scheduler, args.merge_at)?;
    info!(
        flavor = %scheduler.flavor(),
        ticks = args.ticks,
        merge_at = args.merge_at,
        realtime = args.realtime,
        "simulation starting"
    );

    // Both drivers block; keep them off the async executor.
    let (scenario, scheduler) = {
        let scheduler = Arc::clone(&scheduler);
        let (ticks, merge_at, realtime) = (args.ticks, args.merge_at, args.realtime);
        tokio::task::spawn_blocking(move || -> Result<(Scenario, Arc<Scheduler>)> {
            if realtime {
                scenario.run_realtime(&scheduler, ticks, merge_at)?;
            } else {
                scenario.run_stepped(&scheduler, ticks, merge_at)?;
            }
            Ok((scenario, scheduler))
        })
        .await
        .context("simulation thread panicked")??
    };

    match tokio::time::timeout(Duration::from_secs(1), scenario.probe).await {
        Ok(Ok(Ok(tick))) => info!(tick, "call_sync probe answered"),
        Ok(Ok(Err(e))) => warn!(error = %e, "call_sync probe failed"),
        Ok(Err(_)) => warn!("call_sync probe never ran"),
        Err(_) => warn!("call_sync probe timed out"),
    }

    for handle in &scenario.handles {
        info!(
            task = %handle.id(),
            label = handle.label(),
            state = ?handle.state(),
            firings = handle.firings(),
            failure = ?handle.failure(),
            "task summary"
        );
    }

    let cancelled = scheduler.shutdown();
    info!(cancelled, "simulation finished");

    let metrics = scheduler.metrics();
    let json = if args.pretty {
        serde_json::to_string_pretty(&metrics)?
    } else {
        serde_json::to_string(&metrics)?
    };
    println!("{json}");
    Ok(())
}
