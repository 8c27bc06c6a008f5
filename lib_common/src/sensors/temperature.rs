//! # DS18b20 Temperature Sensor
//!
//! A periodic-data sensor. The 1-wire bus read is slow (close to a second per
//! conversion), so after the blocking first read at startup every refresh
//! runs on tokio's blocking pool and lands in a shared cache; the poll loop
//! only ever reads the cache. The state comes from an optional threshold on
//! the cached value, and a state report is forced every `interval`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use regex::Regex;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::device::{SensorCore, SensorDevice};
use super::error::SensorError;
use crate::protocol::{Ordering, SensorData, SensorDataType, StateChange};

/// Anything that produces a temperature in °C. Reads may block.
pub trait TemperatureSource: Send + Sync {
    fn read_celsius(&self) -> Result<f64, SensorError>;
}

/// The kernel's `w1_slave` file of one DS18b20.
#[derive(Debug, Clone)]
pub struct W1SlaveFile {
    path: PathBuf,
}

impl W1SlaveFile {
    pub fn for_sensor(sensor_name: &str) -> Self {
        Self::new(Path::new("/sys/bus/w1/devices").join(sensor_name).join("w1_slave"))
    }

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TemperatureSource for W1SlaveFile {
    fn read_celsius(&self) -> Result<f64, SensorError> {
        parse_w1_slave(&fs::read_to_string(&self.path)?)
    }
}

/// Data line of a `w1_slave` file: nine raw bytes, then the reading.
static W1_DATA_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-f]{2} ){9}t=([+-]?[0-9]+)").expect("valid w1_slave pattern"));

/// # Parse w1_slave
///
/// The second line of the file ends in `t=<millidegrees>`.
pub fn parse_w1_slave(content: &str) -> Result<f64, SensorError> {
    let line = content.lines().nth(1).ok_or_else(|| SensorError::Parse("w1_slave has no data line".into()))?;
    let captures = W1_DATA_LINE
        .captures(line.trim())
        .ok_or_else(|| SensorError::Parse(format!("unexpected w1_slave data line {line:?}")))?;
    let millis: i64 = captures[2].parse().map_err(|e| SensorError::Parse(format!("temperature value: {e}")))?;
    Ok(millis as f64 / 1000.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub ordering: Ordering,
    pub value: f64,
}

impl Threshold {
    /// Whether `reading` puts the sensor into the triggered state.
    pub fn is_triggered_by(&self, reading: f64) -> bool {
        self.ordering.holds(reading, self.value)
    }
}

#[derive(Debug, Clone)]
pub struct TemperatureSettings {
    pub sensor_name: String,
    /// Period of the forced state reports.
    pub interval: Duration,
    /// Minimum time between two refreshes of the cached value.
    pub refresh_interval: Duration,
    pub threshold: Option<Threshold>,
}

pub struct Ds18b20Sensor {
    core: SensorCore,
    settings: TemperatureSettings,
    source: Arc<dyn TemperatureSource>,
    latest: Arc<Mutex<Option<f64>>>,
    refresh_task: Option<JoinHandle<()>>,
    last_refresh: Option<Instant>,
    last_report: Option<Instant>,
}

impl Ds18b20Sensor {
    pub fn new(core: SensorCore, settings: TemperatureSettings, source: Arc<dyn TemperatureSource>) -> Self {
        Self {
            core,
            settings,
            source,
            latest: Arc::new(Mutex::new(None)),
            refresh_task: None,
            last_refresh: None,
            last_report: None,
        }
    }

    /// Starts a background refresh unless one is still running.
    fn start_refresh(&mut self) {
        if self.refresh_task.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!(sensor_id = self.core.id, "Previous temperature read still running");
            return;
        }
        let source = Arc::clone(&self.source);
        let latest = Arc::clone(&self.latest);
        let sensor_id = self.core.id;
        let refresh = move || match source.read_celsius() {
            Ok(value) => *latest.lock().unwrap_or_else(|p| p.into_inner()) = Some(value),
            Err(e) => warn!(sensor_id, "Temperature refresh failed: {}", e),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => self.refresh_task = Some(runtime.spawn_blocking(refresh)),
            Err(_) => refresh(),
        }
    }

    fn cached(&self) -> Option<f64> {
        *self.latest.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn apply(&mut self, value: f64) {
        self.core.sensor_data = SensorData::Float(value);
        if let Some(threshold) = self.settings.threshold {
            self.core.set_triggered(threshold.is_triggered_by(value));
        }
    }

    #[cfg(test)]
    async fn wait_for_refresh(&mut self) {
        if let Some(task) = self.refresh_task.take() {
            task.await.unwrap();
        }
    }
}

impl SensorDevice for Ds18b20Sensor {
    fn core(&self) -> &SensorCore {
        &self.core
    }

    fn initialize(&mut self) -> Result<(), SensorError> {
        self.core.has_latest_data = true;
        self.core.change_state = true;
        self.core.data_type = SensorDataType::Float;
        self.core.state = self.core.normal_state();
        self.core.has_optional_data = true;
        let mut optional = Map::new();
        optional.insert("sensorName".into(), Value::String(self.settings.sensor_name.clone()));
        self.core.optional_data = Some(optional);

        let value = self
            .source
            .read_celsius()
            .map_err(|e| SensorError::Initialization { id: self.core.id, reason: e.to_string() })?;
        *self.latest.lock().unwrap_or_else(|p| p.into_inner()) = Some(value);
        self.apply(value);

        let now = Instant::now();
        self.last_refresh = Some(now);
        self.last_report = Some(now);
        debug!(sensor_id = self.core.id, value, sensor_name = %self.settings.sensor_name, "Initial temperature read");
        Ok(())
    }

    fn update_state(&mut self) -> Result<(), SensorError> {
        let now = Instant::now();
        let due = self
            .last_refresh
            .map_or(true, |last| now.saturating_duration_since(last) > self.settings.refresh_interval);
        if due {
            self.last_refresh = Some(now);
            self.start_refresh();
        }

        if let Some(value) = self.cached() {
            self.apply(value);
        }
        Ok(())
    }

    fn force_send_state(&mut self) -> Result<Option<StateChange>, SensorError> {
        let now = Instant::now();
        let due = self.last_report.map_or(true, |last| now.saturating_duration_since(last) > self.settings.interval);
        if !due {
            return Ok(None);
        }
        self.last_report = Some(now);
        Ok(Some(self.core.status()))
    }
}
