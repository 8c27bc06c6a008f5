//! # Inbound Events
//!
//! Requests the server pushes to a client. Manager nodes use them to keep a
//! mirror of the server state; sensor nodes mostly just acknowledge them.
//! All fields default so older or newer servers with extra or missing fields
//! still decode.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::envelope::{tags, Envelope};
use super::error::ProtocolError;
use super::types::{SensorData, SensorDataType};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptionEntry {
    #[serde(rename = "type")]
    pub option_type: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeEntry {
    pub node_id: u32,
    pub hostname: String,
    pub node_type: String,
    pub instance: String,
    pub connected: bool,
    pub version: f64,
    pub rev: u32,
    pub persistent: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SensorEntry {
    pub sensor_id: u32,
    pub node_id: u32,
    pub remote_sensor_id: u32,
    pub description: String,
    pub alert_delay: u32,
    pub alert_levels: Vec<u32>,
    pub state: u8,
    pub last_state_updated: i64,
    pub data_type: SensorDataType,
    pub sensor_data: SensorData,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertEntry {
    pub alert_id: u32,
    pub node_id: u32,
    pub remote_alert_id: u32,
    pub description: String,
    pub alert_levels: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertLevelEntry {
    pub level: u32,
    pub name: String,
    pub trigger_always: bool,
}

/// Complete server state pushed to manager nodes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusUpdate {
    pub options: Vec<OptionEntry>,
    pub nodes: Vec<NodeEntry>,
    pub sensors: Vec<SensorEntry>,
    pub alerts: Vec<AlertEntry>,
    pub alert_levels: Vec<AlertLevelEntry>,
}

/// A sensor alert as relayed by the server, using server-side sensor ids.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayedSensorAlert {
    pub sensor_id: u32,
    pub state: u8,
    pub alert_levels: Vec<u32>,
    pub description: String,
    pub time_received: i64,
    pub data_type: SensorDataType,
    pub sensor_data: SensorData,
    pub has_optional_data: bool,
    pub optional_data: Option<Map<String, Value>>,
    pub change_state: bool,
    pub has_latest_data: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayedStateChange {
    pub sensor_id: u32,
    pub state: u8,
    pub data_type: SensorDataType,
    pub sensor_data: SensorData,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptionChange {
    pub option_type: String,
    pub value: f64,
}

/// # Inbound Event
///
/// A decoded server request, ready for a [`ServerEventHandler`](crate::connection::ServerEventHandler).
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Status(StatusUpdate),
    SensorAlert(RelayedSensorAlert),
    StateChange(RelayedStateChange),
    Option(OptionChange),
}

impl InboundEvent {
    /// Decodes a server request frame by its tag.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ProtocolError> {
        match envelope.message.as_str() {
            tags::STATUS => Ok(InboundEvent::Status(envelope.payload_as()?)),
            tags::SENSOR_ALERT => Ok(InboundEvent::SensorAlert(envelope.payload_as()?)),
            tags::STATE_CHANGE => Ok(InboundEvent::StateChange(envelope.payload_as()?)),
            tags::OPTION => Ok(InboundEvent::Option(envelope.payload_as()?)),
            other => Err(ProtocolError::UnexpectedTag(other.to_string())),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            InboundEvent::Status(_) => tags::STATUS,
            InboundEvent::SensorAlert(_) => tags::SENSOR_ALERT,
            InboundEvent::StateChange(_) => tags::STATE_CHANGE,
            InboundEvent::Option(_) => tags::OPTION,
        }
    }
}
