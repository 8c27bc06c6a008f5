//! # Threshold-Polling GPIO Sensor
//!
//! Reads the pin on every poll cycle and commits a new state only after the
//! input has differed from the current state for `threshold` consecutive
//! reads.

use tracing::debug;

use super::device::{SensorCore, SensorDevice};
use super::error::SensorError;
use super::hal::GpioInput;
use crate::protocol::{SensorData, SensorDataType};

pub struct GpioPollingSensor {
    core: SensorCore,
    input: Box<dyn GpioInput>,
    threshold: u32,
    differing_reads: u32,
}

impl GpioPollingSensor {
    pub fn new(core: SensorCore, input: Box<dyn GpioInput>, threshold: u32) -> Self {
        Self { core, input, threshold, differing_reads: 0 }
    }
}

impl SensorDevice for GpioPollingSensor {
    fn core(&self) -> &SensorCore {
        &self.core
    }

    fn initialize(&mut self) -> Result<(), SensorError> {
        self.core.has_latest_data = false;
        self.core.change_state = true;
        self.core.data_type = SensorDataType::None;
        self.core.sensor_data = SensorData::None;
        self.core.state = self
            .input
            .read_level()
            .map_err(|e| SensorError::Initialization { id: self.core.id, reason: e.to_string() })?;
        self.differing_reads = 0;
        Ok(())
    }

    fn update_state(&mut self) -> Result<(), SensorError> {
        let level = self.input.read_level()?;
        if level == self.core.state {
            self.differing_reads = 0;
            return Ok(());
        }

        self.differing_reads += 1;
        if self.differing_reads >= self.threshold {
            debug!(sensor_id = self.core.id, level, reads = self.differing_reads, "Input level settled");
            self.core.state = level;
            self.differing_reads = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::hal::mock::ScriptedInput;

    fn sensor(initial: u8, threshold: u32) -> (GpioPollingSensor, ScriptedInput) {
        let input = ScriptedInput::new(&[initial]);
        let core = SensorCore::new(1, "front door", 1).unwrap();
        let mut sensor = GpioPollingSensor::new(core, Box::new(input.clone()), threshold);
        sensor.initialize().unwrap();
        (sensor, input)
    }

    #[test]
    fn test_initial_state_is_first_read() {
        let (sensor, _) = sensor(1, 3);
        assert_eq!(sensor.state(), 1);
        assert!(!sensor.core().has_latest_data);
        assert!(sensor.core().change_state);
    }

    #[test]
    fn test_fewer_differing_reads_than_threshold_keep_state() {
        let (mut sensor, input) = sensor(0, 3);
        input.push(&[1, 1, 0, 1, 1, 0]);
        for _ in 0..6 {
            sensor.update_state().unwrap();
            assert_eq!(sensor.state(), 0);
        }
    }

    #[test]
    fn test_state_flips_after_threshold_consecutive_reads() {
        let (mut sensor, input) = sensor(0, 3);
        input.push(&[1, 1, 1]);
        sensor.update_state().unwrap();
        sensor.update_state().unwrap();
        assert_eq!(sensor.state(), 0);
        sensor.update_state().unwrap();
        assert_eq!(sensor.state(), 1);

        // The counter starts over for the way back.
        input.push(&[0, 0]);
        sensor.update_state().unwrap();
        sensor.update_state().unwrap();
        assert_eq!(sensor.state(), 1);
    }

    #[test]
    fn test_threshold_of_one_flips_immediately() {
        let (mut sensor, input) = sensor(1, 1);
        input.push(&[0]);
        sensor.update_state().unwrap();
        assert_eq!(sensor.state(), 0);
    }
}
