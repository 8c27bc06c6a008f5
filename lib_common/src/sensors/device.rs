//! # Sensor Device
//!
//! The capability every sensor variant implements, plus the fields all of
//! them share. Variants embed a [`SensorCore`] and expose it through
//! [`SensorDevice::core`]; the executer reads alert metadata from there.

use serde_json::{Map, Value};

use super::error::SensorError;
use crate::protocol::{SensorAlert, SensorData, SensorDataType, SensorManifest, StateChange};

/// # Sensor Core
///
/// Identity, alerting behavior and the current state and data of one sensor.
/// `state` and `trigger_state` are always `0` or `1`; the sensor counts as
/// triggered while they are equal.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorCore {
    pub id: u32,
    pub description: String,
    pub alert_delay: u32,
    pub alert_levels: Vec<u32>,
    pub state: u8,
    pub trigger_state: u8,
    /// Send a sensor alert (instead of a state change) when triggered.
    pub trigger_alert: bool,
    /// Send a sensor alert (instead of a state change) when back to normal.
    pub trigger_alert_normal: bool,
    pub data_type: SensorDataType,
    pub sensor_data: SensorData,
    pub has_optional_data: bool,
    pub optional_data: Option<Map<String, Value>>,
    pub has_latest_data: bool,
    pub change_state: bool,
    /// The sensor reports through its `force_send_*` hooks only.
    pub handles_state_msgs: bool,
}

impl SensorCore {
    pub fn new(id: u32, description: impl Into<String>, trigger_state: u8) -> Result<Self, SensorError> {
        if trigger_state > 1 {
            return Err(SensorError::InvalidConfig { id, reason: format!("trigger state must be 0 or 1, got {trigger_state}") });
        }
        Ok(Self {
            id,
            description: description.into(),
            alert_delay: 0,
            alert_levels: Vec::new(),
            state: 1 - trigger_state,
            trigger_state,
            trigger_alert: true,
            trigger_alert_normal: false,
            data_type: SensorDataType::None,
            sensor_data: SensorData::None,
            has_optional_data: false,
            optional_data: None,
            has_latest_data: false,
            change_state: true,
            handles_state_msgs: false,
        })
    }

    pub fn normal_state(&self) -> u8 {
        1 - self.trigger_state
    }

    pub fn is_triggered(&self) -> bool {
        self.state == self.trigger_state
    }

    /// State as the server understands it: `1` triggered, `0` normal.
    pub fn wire_state(&self) -> u8 {
        u8::from(self.is_triggered())
    }

    /// Sets the raw state from a triggered flag.
    pub fn set_triggered(&mut self, triggered: bool) {
        self.state = if triggered { self.trigger_state } else { self.normal_state() };
    }

    pub fn alert(&self, state: u8) -> SensorAlert {
        SensorAlert {
            sensor_id: self.id,
            state,
            data_type: self.data_type,
            sensor_data: self.sensor_data,
            has_optional_data: self.has_optional_data,
            optional_data: self.optional_data.clone(),
            change_state: self.change_state,
            has_latest_data: self.has_latest_data,
        }
    }

    pub fn state_change(&self, state: u8) -> StateChange {
        StateChange { sensor_id: self.id, state, data_type: self.data_type, sensor_data: self.sensor_data }
    }

    /// Current state and data, as reported in full-state snapshots.
    pub fn status(&self) -> StateChange {
        self.state_change(self.wire_state())
    }

    pub fn manifest(&self) -> SensorManifest {
        SensorManifest {
            sensor_id: self.id,
            description: self.description.clone(),
            alert_delay: self.alert_delay,
            alert_levels: self.alert_levels.clone(),
            state: self.wire_state(),
            data_type: self.data_type,
            sensor_data: self.sensor_data,
        }
    }
}

/// # Sensor Device
///
/// One polled sensor. `initialize` runs once at startup and its failure is
/// fatal; the other hooks run on every poll cycle and their failures are
/// isolated to the sensor.
pub trait SensorDevice: Send {
    fn core(&self) -> &SensorCore;

    fn state(&self) -> u8 {
        self.core().state
    }

    fn initialize(&mut self) -> Result<(), SensorError>;

    /// Reads the data source and updates the state per the variant's policy.
    fn update_state(&mut self) -> Result<(), SensorError>;

    /// An alert the sensor wants sent this cycle regardless of transitions.
    fn force_send_alert(&mut self) -> Result<Option<SensorAlert>, SensorError> {
        Ok(None)
    }

    /// A state report the sensor wants sent this cycle regardless of transitions.
    fn force_send_state(&mut self) -> Result<Option<StateChange>, SensorError> {
        Ok(None)
    }
}
