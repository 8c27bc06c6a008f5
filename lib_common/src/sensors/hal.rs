//! # GPIO Access
//!
//! The sensors only ever need two things from the hardware: the current level
//! of an input pin, and a callback when that pin sees an edge. Both sit behind
//! traits so the sensor logic can run against in-memory pins in tests.
//!
//! Default builds use the Linux sysfs GPIO interface. With the `hardware`
//! feature the Raspberry Pi GPIO controller is driven through `rppal`, which
//! also provides real edge interrupts and pull resistors.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use super::error::SensorError;

/// Reads the level of one input pin as `0` or `1`.
pub trait GpioInput: Send {
    fn read_level(&mut self) -> Result<u8, SensorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Falling,
    Rising,
}

impl TryFrom<u8> for Edge {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Edge::Falling),
            1 => Ok(Edge::Rising),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    Down,
    Up,
}

impl TryFrom<u8> for Pull {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Pull::Down),
            1 => Ok(Pull::Up),
            other => Err(other),
        }
    }
}

pub type EdgeCallback = Box<dyn FnMut() + Send + 'static>;

/// Delivers edges of one pin to a callback running outside the poll loop.
pub trait EdgeSource: Send {
    fn watch(&mut self, edge: Edge, pull: Pull, on_edge: EdgeCallback) -> Result<(), SensorError>;
}

/// # Sysfs GPIO
///
/// Reads `/sys/class/gpio/gpio<pin>/value`. The pin must already be exported
/// and configured as an input.
#[derive(Debug, Clone)]
pub struct SysfsGpio {
    pin: u32,
    path: PathBuf,
}

impl SysfsGpio {
    pub fn new(pin: u32) -> Self {
        Self::with_path(pin, format!("/sys/class/gpio/gpio{pin}/value"))
    }

    pub fn with_path(pin: u32, path: impl Into<PathBuf>) -> Self {
        Self { pin, path: path.into() }
    }
}

impl GpioInput for SysfsGpio {
    fn read_level(&mut self) -> Result<u8, SensorError> {
        let raw = fs::read_to_string(&self.path)?;
        match raw.trim() {
            "0" => Ok(0),
            "1" => Ok(1),
            other => Err(SensorError::Parse(format!("gpio{} value {:?} is not a level", self.pin, other))),
        }
    }
}

/// # Polled Edge Source
///
/// Emulates edge interrupts on inputs without interrupt support by sampling
/// the level on a dedicated thread and firing the callback on every matching
/// transition. The thread stops when the source is dropped.
pub struct PolledEdgeSource<G> {
    input: Option<G>,
    period: Duration,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl<G: GpioInput + 'static> PolledEdgeSource<G> {
    pub fn new(input: G, period: Duration) -> Self {
        Self { input: Some(input), period, stop: Arc::new(AtomicBool::new(false)), thread: None }
    }
}

impl<G: GpioInput + 'static> EdgeSource for PolledEdgeSource<G> {
    fn watch(&mut self, edge: Edge, pull: Pull, mut on_edge: EdgeCallback) -> Result<(), SensorError> {
        let mut input = self.input.take().ok_or_else(|| SensorError::Gpio("edge source already watching".into()))?;
        debug!(?pull, "Pull resistors are not configurable through sysfs, relying on board setup");

        let mut last = input.read_level()?;
        let period = self.period;
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new()
            .name("gpio-edge".into())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    thread::sleep(period);
                    let level = match input.read_level() {
                        Ok(level) => level,
                        Err(e) => {
                            warn!("Sampling GPIO input failed: {}", e);
                            continue;
                        }
                    };
                    let fired = match edge {
                        Edge::Rising => last == 0 && level == 1,
                        Edge::Falling => last == 1 && level == 0,
                    };
                    last = level;
                    if fired {
                        on_edge();
                    }
                }
            })
            .map_err(|e| SensorError::Gpio(format!("could not start edge sampling thread: {e}")))?;
        self.thread = Some(handle);
        Ok(())
    }
}

impl<G> Drop for PolledEdgeSource<G> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(feature = "hardware")]
mod rpi {
    use rppal::gpio::{Gpio, InputPin, Level, Trigger};

    use super::{Edge, EdgeCallback, EdgeSource, GpioInput, Pull};
    use crate::sensors::error::SensorError;

    fn gpio_error(e: rppal::gpio::Error) -> SensorError {
        SensorError::Gpio(e.to_string())
    }

    fn pin_number(pin: u32) -> Result<u8, SensorError> {
        u8::try_from(pin).map_err(|_| SensorError::Gpio(format!("pin {pin} out of range")))
    }

    pub struct RppalInput {
        pin: InputPin,
    }

    impl RppalInput {
        pub fn open(pin: u32) -> Result<Self, SensorError> {
            let pin = Gpio::new().map_err(gpio_error)?.get(pin_number(pin)?).map_err(gpio_error)?.into_input();
            Ok(Self { pin })
        }
    }

    impl GpioInput for RppalInput {
        fn read_level(&mut self) -> Result<u8, SensorError> {
            Ok(match self.pin.read() {
                Level::High => 1,
                Level::Low => 0,
            })
        }
    }

    /// Hardware edge interrupts. The pin is held for as long as the source lives.
    pub struct RppalEdgeSource {
        pin: u32,
        input: Option<InputPin>,
    }

    impl RppalEdgeSource {
        pub fn new(pin: u32) -> Self {
            Self { pin, input: None }
        }
    }

    impl EdgeSource for RppalEdgeSource {
        fn watch(&mut self, edge: Edge, pull: Pull, mut on_edge: EdgeCallback) -> Result<(), SensorError> {
            let pin = Gpio::new().map_err(gpio_error)?.get(pin_number(self.pin)?).map_err(gpio_error)?;
            let mut input = match pull {
                Pull::Down => pin.into_input_pulldown(),
                Pull::Up => pin.into_input_pullup(),
            };
            let trigger = match edge {
                Edge::Falling => Trigger::FallingEdge,
                Edge::Rising => Trigger::RisingEdge,
            };
            input.set_async_interrupt(trigger, None, move |_| on_edge()).map_err(gpio_error)?;
            self.input = Some(input);
            Ok(())
        }
    }
}

#[cfg(feature = "hardware")]
pub use rpi::{RppalEdgeSource, RppalInput};

/// Sampling period of the sysfs edge emulation.
#[cfg(not(feature = "hardware"))]
const EDGE_SAMPLE_PERIOD: Duration = Duration::from_millis(20);

/// Opens the platform's input for `pin`.
pub fn open_input(pin: u32) -> Result<Box<dyn GpioInput>, SensorError> {
    #[cfg(feature = "hardware")]
    {
        Ok(Box::new(RppalInput::open(pin)?))
    }
    #[cfg(not(feature = "hardware"))]
    {
        Ok(Box::new(SysfsGpio::new(pin)))
    }
}

/// Opens the platform's edge source for `pin`.
pub fn open_edge_source(pin: u32) -> Result<Box<dyn EdgeSource>, SensorError> {
    #[cfg(feature = "hardware")]
    {
        Ok(Box::new(RppalEdgeSource::new(pin)))
    }
    #[cfg(not(feature = "hardware"))]
    {
        Ok(Box::new(PolledEdgeSource::new(SysfsGpio::new(pin), EDGE_SAMPLE_PERIOD)))
    }
}


#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    use super::mock::ScriptedInput;
    use super::*;

    #[test]
    fn test_edge_and_pull_accept_only_binary_values() {
        assert_eq!(Edge::try_from(0), Ok(Edge::Falling));
        assert_eq!(Edge::try_from(1), Ok(Edge::Rising));
        assert_eq!(Edge::try_from(2), Err(2));
        assert_eq!(Pull::try_from(1), Ok(Pull::Up));
        assert_eq!(Pull::try_from(7), Err(7));
    }

    #[test]
    fn test_sysfs_value_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1").unwrap();
        let mut gpio = SysfsGpio::with_path(17, file.path());
        assert_eq!(gpio.read_level().unwrap(), 1);

        fs::write(file.path(), "0\n").unwrap();
        assert_eq!(gpio.read_level().unwrap(), 0);

        fs::write(file.path(), "high\n").unwrap();
        assert!(matches!(gpio.read_level(), Err(SensorError::Parse(_))));
    }

    #[test]
    fn test_missing_sysfs_pin_is_a_read_error() {
        let mut gpio = SysfsGpio::with_path(99, "/nonexistent/gpio99/value");
        assert!(matches!(gpio.read_level(), Err(SensorError::Read(_))));
    }

    #[test]
    fn test_polled_edges_fire_on_matching_transitions() {
        let input = ScriptedInput::new(&[0, 1, 1, 0, 1, 0]);
        let mut source = PolledEdgeSource::new(input, Duration::from_millis(1));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        source.watch(Edge::Rising, Pull::Down, Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        // 0 -> 1 twice; the input then holds 0 forever.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while fired.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(source.watch(Edge::Rising, Pull::Down, Box::new(|| {})).is_err());
    }
}
