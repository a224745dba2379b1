pub mod config;
pub mod error;
pub mod probe;

pub use config::{load_dotenv, SchedulerConfig};
pub use error::*;
pub use probe::{EnvProbe, HostProbe, RuntimeFlavor, StaticProbe};
