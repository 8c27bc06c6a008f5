//! # lib_common
//!
//! Shared building blocks for the alarm fabric clients. Sensor clients poll
//! their sensors and report alerts and state changes to the central server;
//! manager clients mirror the server state and relay user commands back. Both
//! talk to the server through the same persistent, authenticated TLS
//! connection engine defined here.
//!
//! Modules are gated by Cargo features (all enabled by default):
//!
//! - **`configs`**: typed connection and engine settings.
//! - **`loggers`**: `tracing` setup with console and rotating JSON file output.
//! - **`protocol`**: the newline-delimited JSON wire protocol.
//! - **`connection`**: the connection engine, receiver, watchdog and sender pool.
//! - **`sensors`**: sensor variants and the polling executer.
//! - **`manager`**: the manager-side mirrored model and local admin relay.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "protocol")]
pub mod protocol;
#[cfg(feature = "connection")]
pub mod connection;
#[cfg(feature = "sensors")]
pub mod sensors;
#[cfg(feature = "manager")]
pub mod manager;
