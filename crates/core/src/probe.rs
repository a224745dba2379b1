//! Host capability detection.
//!
//! Which scheduler backend runs is a property of the host runtime, not a
//! caller choice: a host that ticks regions on independent threads needs the
//! regionized backend, anything else gets the single-thread global backend.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Threading model of the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeFlavor {
    /// All game-state mutation happens on one main thread.
    Global,
    /// The world is split into regions, each ticked by its own thread.
    Regionized,
}

impl RuntimeFlavor {
    /// Detect the flavor from a host probe.
    pub fn detect(probe: &dyn HostProbe) -> Self {
        let flavor = if probe.has_region_threading() {
            RuntimeFlavor::Regionized
        } else {
            RuntimeFlavor::Global
        };
        debug!(probe = probe.name(), flavor = %flavor, "detected runtime flavor");
        flavor
    }
}

impl fmt::Display for RuntimeFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeFlavor::Global => f.write_str("global"),
            RuntimeFlavor::Regionized => f.write_str("regionized"),
        }
    }
}

/// Answers capability questions about the host runtime.
pub trait HostProbe: Send + Sync {
    /// Whether the host ticks regions on independent threads.
    fn has_region_threading(&self) -> bool;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// Probe backed by the `COMMONS_THREADED_REGIONS` environment variable,
/// which the host launcher exports when it runs the regionized server.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvProbe;

impl EnvProbe {
    pub const VAR: &'static str = "COMMONS_THREADED_REGIONS";
}

impl HostProbe for EnvProbe {
    fn has_region_threading(&self) -> bool {
        std::env::var(Self::VAR)
            .map(|v| parse_flag(&v))
            .unwrap_or(false)
    }

    fn name(&self) -> &str {
        "env"
    }
}

/// Probe with a fixed answer, for hosts that already know their model.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub RuntimeFlavor);

impl HostProbe for StaticProbe {
    fn has_region_threading(&self) -> bool {
        self.0 == RuntimeFlavor::Regionized
    }

    fn name(&self) -> &str {
        "static"
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
