//! # Logging
//!
//! Structured logging shared by every client binary: a human-readable
//! console layer and a JSON file layer rotated daily.

/// Subscriber installation and log directory handling.
pub mod setup;

pub use setup::setup_logging;
