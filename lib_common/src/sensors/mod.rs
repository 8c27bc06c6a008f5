//! # Sensors
//!
//! Sensor-node side of the client.
//!
//! - **`device`**: the [`SensorDevice`] capability and the shared [`SensorCore`].
//! - **`polling`**: GPIO input debounced over consecutive reads.
//! - **`interrupt`**: GPIO input driven by edge callbacks with burst filtering.
//! - **`temperature`**: DS18b20 1-wire thermometer with background refresh and thresholds.
//! - **`hal`**: GPIO access (sysfs by default, `rppal` with the `hardware` feature).
//! - **`executer`**: the poll loop, transition rules and the shared [`SensorBoard`].

pub mod device;
pub mod error;
pub mod executer;
pub mod hal;
pub mod interrupt;
pub mod polling;
pub mod temperature;

pub use device::{SensorCore, SensorDevice};
pub use error::SensorError;
pub use executer::{SensorBoard, SensorExecuter, SensorPoller};
pub use hal::{open_edge_source, open_input, Edge, EdgeSource, GpioInput, PolledEdgeSource, Pull, SysfsGpio};
pub use interrupt::{EdgeHandle, GpioInterruptSensor, InterruptSettings};
pub use polling::GpioPollingSensor;
pub use temperature::{parse_w1_slave, Ds18b20Sensor, TemperatureSettings, TemperatureSource, Threshold, W1SlaveFile};
