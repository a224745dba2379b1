use std::path::PathBuf;

use clap::Parser;

/// Tick simulator for the commons scheduler.
///
/// Loads a handful of regions, schedules global, region, entity and async
/// work, merges two regions part way through and prints the resulting
/// metrics as JSON.
#[derive(Parser, Debug)]
#[command(name = "commons-sim", about = "Tick simulator for the commons scheduler")]
pub struct CliArgs {
    /// Scheduler config file (TOML). Falls back to environment variables.
    #[arg(long, env = "COMMONS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of ticks to simulate
    #[arg(long, default_value = "60")]
    pub ticks: u64,

    /// Tick at which the first region merges into the second
    #[arg(long, default_value = "20")]
    pub merge_at: u64,

    /// Force the regionized backend instead of probing the environment
    #[arg(long)]
    pub threaded_regions: bool,

    /// Drive ticks from wall-clock threads instead of stepping them in order
    #[arg(long)]
    pub realtime: bool,

    /// Pretty-print the metrics JSON
    #[arg(long)]
    pub pretty: bool,
}
