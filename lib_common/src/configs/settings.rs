use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to load TLS material from {}: {reason}", .path.display())]
    TlsMaterial { path: PathBuf, reason: String },
}

/// # Client Type
///
/// The role a node announces during authentication and registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    #[default]
    Sensor,
    Manager,
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientType::Sensor => write!(f, "sensor"),
            ClientType::Manager => write!(f, "manager"),
        }
    }
}

/// # Engine Timings
///
/// Every interval, timeout and bound used by the connection engine, the
/// watchdog, the sender pool and the sensor executer. Values are kept as plain
/// integers so they read naturally in a JSON configuration file; the accessor
/// methods convert them to [`Duration`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineTimings {
    /// Sensor poll cadence in milliseconds.
    pub poll_interval_ms: u64,
    /// Time between keepalive pings on an idle session.
    pub keepalive_interval_secs: u64,
    /// How long a keepalive may stay unanswered before the session is dropped.
    pub keepalive_timeout_secs: u64,
    /// How long any other request may stay unanswered.
    pub response_timeout_secs: u64,
    /// TCP connect plus TLS handshake budget.
    pub connect_timeout_secs: u64,
    /// Send attempts for a sensor alert before giving up.
    pub alert_retry_attempts: u32,
    /// Watchdog check cadence.
    pub watchdog_interval_secs: u64,
    /// A session without inbound traffic for this long is considered dead.
    pub stale_threshold_secs: u64,
    /// First reconnect delay.
    pub reconnect_base_delay_ms: u64,
    /// Upper bound of the reconnect delay.
    pub reconnect_max_delay_ms: u64,
    /// Consecutive undecodable frames tolerated before the session is dropped.
    pub max_malformed_frames: u32,
    /// Consecutive unanswered requests tolerated before the session is dropped.
    pub max_correlation_failures: u32,
    /// Worker tasks draining the outbound event queue.
    pub sender_workers: usize,
    /// Capacity of the outbound event queue.
    pub sender_queue_capacity: usize,
    /// Maximum age of the last full-state snapshot sent to the server.
    pub full_state_interval_secs: u64,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            keepalive_interval_secs: 30,
            keepalive_timeout_secs: 20,
            response_timeout_secs: 10,
            connect_timeout_secs: 10,
            alert_retry_attempts: 3,
            watchdog_interval_secs: 5,
            stale_threshold_secs: 90,
            reconnect_base_delay_ms: 1_000,
            reconnect_max_delay_ms: 60_000,
            max_malformed_frames: 3,
            max_correlation_failures: 3,
            sender_workers: 4,
            sender_queue_capacity: 256,
            full_state_interval_secs: 60,
        }
    }
}

impl EngineTimings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn full_state_interval(&self) -> Duration {
        Duration::from_secs(self.full_state_interval_secs)
    }

    /// # Validate
    ///
    /// Rejects combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid { field: "pollIntervalMs", reason: "must be greater than zero".into() });
        }
        if self.watchdog_interval_secs == 0 {
            return Err(ConfigError::Invalid { field: "watchdogIntervalSecs", reason: "must be greater than zero".into() });
        }
        if self.keepalive_timeout_secs >= self.stale_threshold_secs {
            return Err(ConfigError::Invalid {
                field: "keepaliveTimeoutSecs",
                reason: format!("must be shorter than the stale threshold ({}s)", self.stale_threshold_secs),
            });
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "reconnectBaseDelayMs",
                reason: "must not exceed reconnectMaxDelayMs".into(),
            });
        }
        if self.alert_retry_attempts == 0 {
            return Err(ConfigError::Invalid { field: "alertRetryAttempts", reason: "at least one attempt is required".into() });
        }
        if self.sender_workers == 0 || self.sender_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "senderWorkers",
                reason: "worker count and queue capacity must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

/// # Connection Settings
///
/// Server address, TLS material, credentials and node identity of a client.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    pub server_host: String,
    pub server_port: u16,
    /// PEM file with the CA (or pinned server certificate) to trust. When unset
    /// the platform trust store plus the bundled web roots are used.
    pub server_ca_file: Option<PathBuf>,
    pub client_cert_file: Option<PathBuf>,
    pub client_key_file: Option<PathBuf>,
    pub username: String,
    pub password: String,
    /// Node instance name announced during registration.
    pub instance: String,
    /// Whether the server should keep the node registered while it is offline.
    pub persistent: bool,
    pub client_type: ClientType,
    pub timings: EngineTimings,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            server_host: "localhost".to_string(),
            server_port: 44556,
            server_ca_file: None,
            client_cert_file: None,
            client_key_file: None,
            username: String::new(),
            password: String::new(),
            instance: String::new(),
            persistent: true,
            client_type: ClientType::Sensor,
            timings: EngineTimings::default(),
        }
    }
}

impl ConnectionSettings {
    /// # Validate
    ///
    /// Checks the settings a connection attempt cannot do without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_host.trim().is_empty() {
            return Err(ConfigError::Missing("serverHost"));
        }
        if self.server_port == 0 {
            return Err(ConfigError::Invalid { field: "serverPort", reason: "port 0 is not connectable".into() });
        }
        if self.username.is_empty() {
            return Err(ConfigError::Missing("username"));
        }
        if self.instance.trim().is_empty() {
            return Err(ConfigError::Missing("instance"));
        }
        if self.client_cert_file.is_some() != self.client_key_file.is_some() {
            return Err(ConfigError::Invalid {
                field: "clientCertFile",
                reason: "client certificate and key must be configured together".into(),
            });
        }
        self.timings.validate()
    }
}

// Credentials stay out of log output.
impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("server_host", &self.server_host)
            .field("server_port", &self.server_port)
            .field("server_ca_file", &self.server_ca_file)
            .field("client_cert_file", &self.client_cert_file)
            .field("client_key_file", &self.client_key_file)
            .field("username", &self.username)
            .field("password", &"********")
            .field("instance", &self.instance)
            .field("persistent", &self.persistent)
            .field("client_type", &self.client_type)
            .field("timings", &self.timings)
            .finish()
    }
}
