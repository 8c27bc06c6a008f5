//! Payloads the clients send to the server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::types::{SensorData, SensorDataType};

/// Protocol version announced during authentication.
pub const PROTOCOL_VERSION: f64 = 0.3;
/// Protocol revision announced during authentication.
pub const PROTOCOL_REV: u32 = 1;

/// Node role announced to the server.
pub use crate::configs::ClientType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationRequest {
    pub version: f64,
    pub rev: u32,
    pub username: String,
    pub password: String,
    pub client_type: ClientType,
}

/// Version information the server answers the authentication with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub version: f64,
    pub rev: u32,
}

impl ServerVersion {
    pub fn local() -> Self {
        Self { version: PROTOCOL_VERSION, rev: PROTOCOL_REV }
    }
}

/// # Sensor Manifest
///
/// Registration entry describing one sensor of a sensor node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorManifest {
    pub sensor_id: u32,
    pub description: String,
    pub alert_delay: u32,
    pub alert_levels: Vec<u32>,
    pub state: u8,
    pub data_type: SensorDataType,
    pub sensor_data: SensorData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerManifest {
    pub description: String,
}

/// What a node registers besides its identity.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeManifest {
    Sensors(Vec<SensorManifest>),
    Manager(ManagerManifest),
}

impl NodeManifest {
    pub fn client_type(&self) -> ClientType {
        match self {
            NodeManifest::Sensors(_) => ClientType::Sensor,
            NodeManifest::Manager(_) => ClientType::Manager,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub hostname: String,
    pub node_type: ClientType,
    pub instance: String,
    pub persistent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensors: Option<Vec<SensorManifest>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<ManagerManifest>,
}

impl RegistrationRequest {
    pub fn new(hostname: String, instance: String, persistent: bool, manifest: NodeManifest) -> Self {
        let node_type = manifest.client_type();
        let (sensors, manager) = match manifest {
            NodeManifest::Sensors(sensors) => (Some(sensors), None),
            NodeManifest::Manager(manager) => (None, Some(manager)),
        };
        Self { hostname, node_type, instance, persistent, sensors, manager }
    }
}

/// # Sensor Alert
///
/// A triggered or normal transition the server's alerting logic should act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorAlert {
    pub sensor_id: u32,
    /// `1` triggered, `0` normal.
    pub state: u8,
    pub data_type: SensorDataType,
    pub sensor_data: SensorData,
    pub has_optional_data: bool,
    #[serde(default)]
    pub optional_data: Option<Map<String, Value>>,
    pub change_state: bool,
    pub has_latest_data: bool,
}

/// A state or data update without an alerting request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChange {
    pub sensor_id: u32,
    pub state: u8,
    pub data_type: SensorDataType,
    pub sensor_data: SensorData,
}

/// Full snapshot of every sensor of the node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorsState {
    pub sensors: Vec<StateChange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionRequest {
    pub option_type: String,
    pub value: f64,
    pub time_delay: u32,
}
