//! # Client Configuration
//!
//! Settings are layered: built-in defaults, then the JSON configuration file,
//! then environment variables and command-line flags (clap reads both). The
//! sensor list only comes from the file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::warn;

use lib_common::configs::{ClientType, ConnectionSettings};

use crate::sensors::SensorConfig;

#[derive(Parser, Debug, Clone, Default)]
#[clap(about = "Alarm fabric client node", version)]
pub struct Cli {
    #[clap(long, env = "ALARM_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "ALARM_SERVER_HOST", help = "Alarm server host name (also used for TLS verification).")]
    pub server_host: Option<String>,

    #[clap(long, env = "ALARM_SERVER_PORT", help = "Alarm server port.")]
    pub server_port: Option<u16>,

    #[clap(long, env = "ALARM_SERVER_CA_FILE", help = "PEM file with the CA or server certificate to trust.")]
    pub server_ca_file: Option<PathBuf>,

    #[clap(long, env = "ALARM_CLIENT_CERT_FILE", help = "PEM client certificate for mutual TLS.")]
    pub client_cert_file: Option<PathBuf>,

    #[clap(long, env = "ALARM_CLIENT_KEY_FILE", help = "PEM private key for mutual TLS.")]
    pub client_key_file: Option<PathBuf>,

    #[clap(long, env = "ALARM_USERNAME", help = "Username for server authentication.")]
    pub username: Option<String>,

    #[clap(long, env = "ALARM_PASSWORD", hide_env_values = true, help = "Password for server authentication.")]
    pub password: Option<String>,

    #[clap(long, env = "ALARM_INSTANCE", help = "Instance name this node registers with.")]
    pub instance: Option<String>,

    #[clap(long, env = "ALARM_DESCRIPTION", help = "Description of a manager node.")]
    pub description: Option<String>,

    #[clap(long, env = "ALARM_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "ALARM_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "ALARM_ADMIN_SOCKET", help = "Unix socket of the local admin relay (manager nodes).")]
    pub admin_socket: Option<PathBuf>,
}

/// # Client Config
///
/// The resolved configuration of one node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub connection: ConnectionSettings,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub description: String,
    pub admin_socket: PathBuf,
    pub sensors: Vec<SensorConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionSettings::default(),
            log_dir: PathBuf::from("./logs"),
            log_level: "info".to_string(),
            description: String::new(),
            admin_socket: PathBuf::from("/tmp/alarm_manager.sock"),
            sensors: Vec::new(),
        }
    }
}

impl ClientConfig {
    /// Applies flags and environment variables over the current values.
    fn merge_cli(mut self, cli: Cli) -> Self {
        let connection = &mut self.connection;
        if let Some(host) = cli.server_host {
            connection.server_host = host;
        }
        if let Some(port) = cli.server_port {
            connection.server_port = port;
        }
        connection.server_ca_file = cli.server_ca_file.or(connection.server_ca_file.take());
        connection.client_cert_file = cli.client_cert_file.or(connection.client_cert_file.take());
        connection.client_key_file = cli.client_key_file.or(connection.client_key_file.take());
        if let Some(username) = cli.username {
            connection.username = username;
        }
        if let Some(password) = cli.password {
            connection.password = password;
        }
        if let Some(instance) = cli.instance {
            connection.instance = instance;
        }
        if let Some(description) = cli.description {
            self.description = description;
        }
        if let Some(log_dir) = cli.log_dir {
            self.log_dir = log_dir;
        }
        if let Some(log_level) = cli.log_level {
            self.log_level = log_level;
        }
        if let Some(admin_socket) = cli.admin_socket {
            self.admin_socket = admin_socket;
        }
        self
    }
}

/// Reads the JSON configuration file, or the defaults when it does not exist.
fn read_config_file(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults, environment and flags");
        return Ok(ClientConfig::default());
    }
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Trust anchor used when none is configured: `~/.alarm_client/server.crt`.
fn default_ca_file() -> Option<PathBuf> {
    let candidate = dirs::home_dir()?.join(".alarm_client").join("server.crt");
    candidate.exists().then_some(candidate)
}

/// # Load Config
///
/// Resolves the configuration of a node of `client_type`. `default_file` is
/// read when no config path was given. The result is validated.
pub fn load_config(cli: Cli, client_type: ClientType, default_file: &str) -> Result<ClientConfig> {
    let path = cli.config_path.clone().unwrap_or_else(|| PathBuf::from(default_file));
    let mut config = read_config_file(&path)?.merge_cli(cli);

    config.connection.client_type = client_type;
    if config.connection.server_ca_file.is_none() {
        config.connection.server_ca_file = default_ca_file();
    }
    config.connection.validate().context("invalid connection settings")?;
    Ok(config)
}
