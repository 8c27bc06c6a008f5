//! # Client Logic
//!
//! Startup helpers shared by the `sensor_client` and `manager_client`
//! binaries: configuration loading and sensor construction.

pub mod config;
pub mod sensors;

pub use config::{load_config, Cli, ClientConfig};
pub use sensors::{build_sensor, build_sensors, SensorConfig, SensorKind};
