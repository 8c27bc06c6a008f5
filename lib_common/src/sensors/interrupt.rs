//! # Edge-Interrupt GPIO Sensor
//!
//! The state is set from the edge callback, which runs on whatever thread the
//! GPIO backend delivers interrupts on. The callback and the poll loop share
//! an [`EdgeTracker`] behind a mutex; the poll loop publishes the tracked
//! state and reverts it to normal once the trigger has aged out.
//!
//! Edge storms are filtered: an edge arriving more than
//! `delay_between_triggers` after the start of the previous burst starts a new
//! burst, and the sensor only triggers once a burst has counted
//! `edge_count_before_trigger` edges.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::device::{SensorCore, SensorDevice};
use super::error::SensorError;
use super::hal::{Edge, EdgeSource, Pull};
use crate::protocol::{SensorData, SensorDataType};

#[derive(Debug, Clone)]
pub struct InterruptSettings {
    pub delay_between_triggers: Duration,
    pub time_sensor_triggered: Duration,
    pub edge_count_before_trigger: u32,
    /// `0` falling, `1` rising.
    pub edge: u8,
    /// `0` pull-down, `1` pull-up.
    pub pull: u8,
}

#[derive(Debug)]
struct EdgeTracker {
    state: u8,
    burst_started: Option<Instant>,
    edges: u32,
}

fn lock(tracker: &Mutex<EdgeTracker>) -> MutexGuard<'_, EdgeTracker> {
    tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The part of the sensor handed to the edge callback.
#[derive(Clone)]
pub struct EdgeHandle {
    sensor_id: u32,
    trigger_state: u8,
    delay_between_triggers: Duration,
    edge_count_before_trigger: u32,
    tracker: Arc<Mutex<EdgeTracker>>,
}

impl EdgeHandle {
    pub fn on_edge(&self) {
        self.on_edge_at(Instant::now());
    }

    fn on_edge_at(&self, now: Instant) {
        let mut tracker = lock(&self.tracker);
        let new_burst = tracker
            .burst_started
            .map_or(true, |started| now.saturating_duration_since(started) > self.delay_between_triggers);
        if new_burst {
            tracker.edges = 1;
            tracker.burst_started = Some(now);
        } else {
            tracker.edges = tracker.edges.saturating_add(1);
        }

        if tracker.edges >= self.edge_count_before_trigger && tracker.state != self.trigger_state {
            debug!(sensor_id = self.sensor_id, edges = tracker.edges, "Edge burst triggered sensor");
            tracker.state = self.trigger_state;
        }
    }
}

pub struct GpioInterruptSensor {
    core: SensorCore,
    settings: InterruptSettings,
    source: Box<dyn EdgeSource>,
    tracker: Arc<Mutex<EdgeTracker>>,
}

impl GpioInterruptSensor {
    pub fn new(core: SensorCore, settings: InterruptSettings, source: Box<dyn EdgeSource>) -> Self {
        let tracker = EdgeTracker { state: core.normal_state(), burst_started: None, edges: 0 };
        Self { core, settings, source, tracker: Arc::new(Mutex::new(tracker)) }
    }

    pub fn edge_handle(&self) -> EdgeHandle {
        EdgeHandle {
            sensor_id: self.core.id,
            trigger_state: self.core.trigger_state,
            delay_between_triggers: self.settings.delay_between_triggers,
            edge_count_before_trigger: self.settings.edge_count_before_trigger,
            tracker: Arc::clone(&self.tracker),
        }
    }

    fn invalid(&self, reason: String) -> SensorError {
        SensorError::Initialization { id: self.core.id, reason }
    }
}

impl SensorDevice for GpioInterruptSensor {
    fn core(&self) -> &SensorCore {
        &self.core
    }

    fn initialize(&mut self) -> Result<(), SensorError> {
        let edge = Edge::try_from(self.settings.edge)
            .map_err(|value| self.invalid(format!("edge must be 0 (falling) or 1 (rising), got {value}")))?;
        let pull = Pull::try_from(self.settings.pull)
            .map_err(|value| self.invalid(format!("pull must be 0 (down) or 1 (up), got {value}")))?;

        self.core.has_latest_data = false;
        self.core.change_state = true;
        self.core.data_type = SensorDataType::None;
        self.core.sensor_data = SensorData::None;
        self.core.state = self.core.normal_state();
        lock(&self.tracker).state = self.core.state;

        let handle = self.edge_handle();
        self.source
            .watch(edge, pull, Box::new(move || handle.on_edge()))
            .map_err(|e| self.invalid(e.to_string()))?;
        info!(sensor_id = self.core.id, ?edge, ?pull, "Watching GPIO edges");
        Ok(())
    }

    fn update_state(&mut self) -> Result<(), SensorError> {
        let now = Instant::now();
        let mut tracker = lock(&self.tracker);
        if self.core.state == self.core.trigger_state {
            let expired = tracker
                .burst_started
                .map_or(true, |started| now.saturating_duration_since(started) > self.settings.time_sensor_triggered);
            if expired {
                tracker.state = self.core.normal_state();
            }
        }
        self.core.state = tracker.state;
        Ok(())
    }
}
