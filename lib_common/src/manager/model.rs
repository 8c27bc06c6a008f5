//! # Manager Model
//!
//! A manager node's mirror of the server state. The server seeds it with a
//! full `status` push after registration and keeps it current with relayed
//! alerts, state changes and option changes.

use std::collections::VecDeque;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::connection::{RegistrationProvider, ServerEventHandler};
use crate::protocol::inbound::{
    AlertEntry, AlertLevelEntry, NodeEntry, OptionChange, OptionEntry, RelayedSensorAlert, RelayedStateChange,
    SensorEntry, StatusUpdate,
};
use crate::protocol::{unix_now, InboundEvent, ManagerManifest, NodeManifest};

/// Received sensor alerts kept for display.
pub const ALERT_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Default)]
struct ModelState {
    options: Vec<OptionEntry>,
    nodes: Vec<NodeEntry>,
    sensors: Vec<SensorEntry>,
    alerts: Vec<AlertEntry>,
    alert_levels: Vec<AlertLevelEntry>,
    recent_alerts: VecDeque<RelayedSensorAlert>,
    last_status_update: Option<i64>,
}

#[derive(Debug, Default)]
pub struct ManagerModel {
    state: RwLock<ModelState>,
}

impl ManagerModel {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, ModelState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ModelState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn options(&self) -> Vec<OptionEntry> {
        self.read().options.clone()
    }

    pub fn option_value(&self, option_type: &str) -> Option<f64> {
        self.read().options.iter().find(|o| o.option_type == option_type).map(|o| o.value)
    }

    pub fn nodes(&self) -> Vec<NodeEntry> {
        self.read().nodes.clone()
    }

    pub fn sensors(&self) -> Vec<SensorEntry> {
        self.read().sensors.clone()
    }

    pub fn sensor(&self, sensor_id: u32) -> Option<SensorEntry> {
        self.read().sensors.iter().find(|s| s.sensor_id == sensor_id).cloned()
    }

    pub fn alerts(&self) -> Vec<AlertEntry> {
        self.read().alerts.clone()
    }

    pub fn alert_levels(&self) -> Vec<AlertLevelEntry> {
        self.read().alert_levels.clone()
    }

    /// Newest last.
    pub fn recent_alerts(&self) -> Vec<RelayedSensorAlert> {
        self.read().recent_alerts.iter().cloned().collect()
    }

    /// Unix time of the last full status push, if any.
    pub fn last_status_update(&self) -> Option<i64> {
        self.read().last_status_update
    }

    fn apply_status(&self, status: StatusUpdate) {
        let mut state = self.write();
        info!(
            nodes = status.nodes.len(),
            sensors = status.sensors.len(),
            alerts = status.alerts.len(),
            "Received full status from server"
        );
        state.options = status.options;
        state.nodes = status.nodes;
        state.sensors = status.sensors;
        state.alerts = status.alerts;
        state.alert_levels = status.alert_levels;
        state.last_status_update = Some(unix_now());
    }

    fn apply_alert(&self, alert: RelayedSensorAlert) {
        let mut state = self.write();
        if alert.change_state {
            match state.sensors.iter_mut().find(|s| s.sensor_id == alert.sensor_id) {
                Some(sensor) => {
                    sensor.state = alert.state;
                    sensor.last_state_updated = unix_now();
                    if alert.has_latest_data {
                        sensor.data_type = alert.data_type;
                        sensor.sensor_data = alert.sensor_data;
                    }
                }
                None => warn!(sensor_id = alert.sensor_id, "Alert for a sensor missing from the last status"),
            }
        }

        info!(sensor_id = alert.sensor_id, state = alert.state, description = %alert.description, "Sensor alert received");
        if state.recent_alerts.len() == ALERT_HISTORY_LIMIT {
            state.recent_alerts.pop_front();
        }
        state.recent_alerts.push_back(alert);
    }

    fn apply_state_change(&self, change: RelayedStateChange) -> Result<(), String> {
        let mut state = self.write();
        let sensor = state
            .sensors
            .iter_mut()
            .find(|s| s.sensor_id == change.sensor_id)
            .ok_or_else(|| format!("unknown sensor id {}", change.sensor_id))?;
        sensor.state = change.state;
        sensor.data_type = change.data_type;
        sensor.sensor_data = change.sensor_data;
        sensor.last_state_updated = unix_now();
        debug!(sensor_id = change.sensor_id, state = change.state, "Sensor state changed");
        Ok(())
    }

    fn apply_option(&self, change: OptionChange) {
        let mut state = self.write();
        info!(option_type = %change.option_type, value = change.value, "Option changed");
        match state.options.iter_mut().find(|o| o.option_type == change.option_type) {
            Some(option) => option.value = change.value,
            None => state.options.push(OptionEntry { option_type: change.option_type, value: change.value }),
        }
    }
}

impl ServerEventHandler for ManagerModel {
    fn handle_event(&self, event: InboundEvent) -> Result<(), String> {
        match event {
            InboundEvent::Status(status) => self.apply_status(status),
            InboundEvent::SensorAlert(alert) => self.apply_alert(alert),
            InboundEvent::StateChange(change) => self.apply_state_change(change)?,
            InboundEvent::Option(change) => self.apply_option(change),
        }
        Ok(())
    }
}

/// Registration data of a manager node.
#[derive(Debug, Clone)]
pub struct ManagerProfile {
    pub description: String,
}

impl RegistrationProvider for ManagerProfile {
    fn manifest(&self) -> NodeManifest {
        NodeManifest::Manager(ManagerManifest { description: self.description.clone() })
    }
}
