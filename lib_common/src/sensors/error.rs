use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Sensor {id} failed to initialize: {reason}")]
    Initialization { id: u32, reason: String },

    #[error("Invalid configuration for sensor {id}: {reason}")]
    InvalidConfig { id: u32, reason: String },

    #[error("Reading sensor input failed: {0}")]
    Read(#[from] std::io::Error),

    #[error("Could not parse sensor data: {0}")]
    Parse(String),

    #[error("GPIO error: {0}")]
    Gpio(String),
}
