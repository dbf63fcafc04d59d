//! silt-core — configuration and shared defaults for the Silt control plane.

pub mod config;

pub use config::{Config, ConfigError, ControlPlaneConfig, TurfConfig, WorkerDefaults};
