//! # Configuration Modules
//!
//! Typed settings consumed by the connection engine and the sensor executer.
//! Every field carries a serde default so partial JSON configuration files
//! deserialize cleanly.

/// Connection, credential and engine timing settings.
pub mod settings;

pub use settings::{ClientType, ConfigError, ConnectionSettings, EngineTimings};
