//! # Sensor Construction
//!
//! Turns the `sensors` entries of the configuration file into initialized
//! sensor devices. Any sensor that cannot be built or initialized stops the
//! node from starting.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use lib_common::protocol::Ordering;
use lib_common::sensors::{
    open_edge_source, open_input, Ds18b20Sensor, GpioInput, GpioInterruptSensor, GpioPollingSensor,
    InterruptSettings, SensorCore, SensorDevice, SensorError, SysfsGpio, TemperatureSettings, Threshold,
    W1SlaveFile,
};

fn default_true() -> bool {
    true
}

fn default_trigger_state() -> u8 {
    1
}

fn default_threshold_counter() -> u32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdConfig {
    pub ordering: Ordering,
    pub value: f64,
}

/// Variant-specific settings, selected by the `kind` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SensorKind {
    #[serde(rename_all = "camelCase")]
    GpioPolling {
        gpio_pin: u32,
        #[serde(default = "default_threshold_counter")]
        threshold_counter: u32,
        /// Overrides the sysfs value file of the pin.
        #[serde(default)]
        value_path: Option<PathBuf>,
    },
    #[serde(rename_all = "camelCase")]
    GpioInterrupt {
        gpio_pin: u32,
        delay_between_triggers_secs: u64,
        time_sensor_triggered_secs: u64,
        edge_count_before_trigger: u32,
        edge: u8,
        pulled_up_or_down: u8,
    },
    #[serde(rename_all = "camelCase")]
    Ds18b20 {
        sensor_name: String,
        interval_secs: u64,
        refresh_interval_secs: u64,
        #[serde(default)]
        threshold: Option<ThresholdConfig>,
        /// Overrides `/sys/bus/w1/devices/<sensorName>/w1_slave`.
        #[serde(default)]
        device_path: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorConfig {
    pub id: u32,
    pub description: String,
    #[serde(default)]
    pub alert_delay: u32,
    #[serde(default)]
    pub alert_levels: Vec<u32>,
    #[serde(default = "default_trigger_state")]
    pub trigger_state: u8,
    #[serde(default = "default_true")]
    pub trigger_alert: bool,
    #[serde(default)]
    pub trigger_alert_normal: bool,
    #[serde(flatten)]
    pub kind: SensorKind,
}

/// Builds one sensor without touching its data source.
pub fn build_sensor(config: &SensorConfig) -> Result<Box<dyn SensorDevice>, SensorError> {
    let mut core = SensorCore::new(config.id, config.description.clone(), config.trigger_state)?;
    core.alert_delay = config.alert_delay;
    core.alert_levels = config.alert_levels.clone();
    core.trigger_alert = config.trigger_alert;
    core.trigger_alert_normal = config.trigger_alert_normal;

    let sensor: Box<dyn SensorDevice> = match &config.kind {
        SensorKind::GpioPolling { gpio_pin, threshold_counter, value_path } => {
            let input: Box<dyn GpioInput> = match value_path {
                Some(path) => Box::new(SysfsGpio::with_path(*gpio_pin, path)),
                None => open_input(*gpio_pin)?,
            };
            Box::new(GpioPollingSensor::new(core, input, *threshold_counter))
        }
        SensorKind::GpioInterrupt {
            gpio_pin,
            delay_between_triggers_secs,
            time_sensor_triggered_secs,
            edge_count_before_trigger,
            edge,
            pulled_up_or_down,
        } => {
            let settings = InterruptSettings {
                delay_between_triggers: Duration::from_secs(*delay_between_triggers_secs),
                time_sensor_triggered: Duration::from_secs(*time_sensor_triggered_secs),
                edge_count_before_trigger: *edge_count_before_trigger,
                edge: *edge,
                pull: *pulled_up_or_down,
            };
            Box::new(GpioInterruptSensor::new(core, settings, open_edge_source(*gpio_pin)?))
        }
        SensorKind::Ds18b20 { sensor_name, interval_secs, refresh_interval_secs, threshold, device_path } => {
            let source = match device_path {
                Some(path) => W1SlaveFile::new(path),
                None => W1SlaveFile::for_sensor(sensor_name),
            };
            let settings = TemperatureSettings {
                sensor_name: sensor_name.clone(),
                interval: Duration::from_secs(*interval_secs),
                refresh_interval: Duration::from_secs(*refresh_interval_secs),
                threshold: threshold.as_ref().map(|t| Threshold { ordering: t.ordering, value: t.value }),
            };
            Box::new(Ds18b20Sensor::new(core, settings, Arc::new(source)))
        }
    };
    Ok(sensor)
}

/// # Build Sensors
///
/// Builds and initializes every configured sensor. Sensor ids must be unique.
pub fn build_sensors(configs: &[SensorConfig]) -> Result<Vec<Box<dyn SensorDevice>>, SensorError> {
    let mut seen = HashSet::new();
    let mut sensors = Vec::with_capacity(configs.len());
    for config in configs {
        if !seen.insert(config.id) {
            return Err(SensorError::InvalidConfig { id: config.id, reason: "duplicate sensor id".into() });
        }
        let mut sensor = build_sensor(config)?;
        sensor.initialize()?;
        info!(sensor_id = config.id, description = %config.description, state = sensor.state(), "Sensor initialized");
        sensors.push(sensor);
    }
    Ok(sensors)
}
