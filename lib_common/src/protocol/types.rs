//! Scalar wire types shared by alerts, state changes and registrations.

use serde::{Deserialize, Serialize};

/// # Sensor Data Type
///
/// Encoded as an integer on the wire: `0` none, `1` integer, `2` float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SensorDataType {
    #[default]
    None,
    Integer,
    Float,
}

impl From<SensorDataType> for u8 {
    fn from(value: SensorDataType) -> Self {
        match value {
            SensorDataType::None => 0,
            SensorDataType::Integer => 1,
            SensorDataType::Float => 2,
        }
    }
}

impl TryFrom<u8> for SensorDataType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SensorDataType::None),
            1 => Ok(SensorDataType::Integer),
            2 => Ok(SensorDataType::Float),
            other => Err(format!("unknown sensor data type {other}")),
        }
    }
}

/// # Sensor Data
///
/// The typed value a sensor reports next to its state: `null`, an integer or
/// a float on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensorData {
    #[default]
    None,
    Int(i64),
    Float(f64),
}

impl SensorData {
    /// The data type tag matching this value.
    pub fn data_type(&self) -> SensorDataType {
        match self {
            SensorData::None => SensorDataType::None,
            SensorData::Int(_) => SensorDataType::Integer,
            SensorData::Float(_) => SensorDataType::Float,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SensorData::None => None,
            SensorData::Int(v) => Some(*v as f64),
            SensorData::Float(v) => Some(*v),
        }
    }
}

/// # Ordering
///
/// Comparison used by threshold-evaluating sensors: `0` less than, `1` equal,
/// `2` greater than.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Ordering {
    LessThan,
    Equal,
    GreaterThan,
}

impl From<Ordering> for u8 {
    fn from(value: Ordering) -> Self {
        match value {
            Ordering::LessThan => 0,
            Ordering::Equal => 1,
            Ordering::GreaterThan => 2,
        }
    }
}

impl TryFrom<u8> for Ordering {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Ordering::LessThan),
            1 => Ok(Ordering::Equal),
            2 => Ok(Ordering::GreaterThan),
            other => Err(format!("unknown ordering {other}")),
        }
    }
}

impl Ordering {
    /// Whether `value` stands in this relation to `threshold`.
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Ordering::LessThan => value < threshold,
            Ordering::Equal => value == threshold,
            Ordering::GreaterThan => value > threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_is_an_integer_on_the_wire() {
        assert_eq!(serde_json::to_string(&SensorDataType::Float).unwrap(), "2");
        let parsed: SensorDataType = serde_json::from_str("1").unwrap();
        assert_eq!(parsed, SensorDataType::Integer);
        assert!(serde_json::from_str::<SensorDataType>("7").is_err());
    }

    #[test]
    fn test_sensor_data_untagged() {
        assert_eq!(serde_json::to_string(&SensorData::None).unwrap(), "null");
        assert_eq!(serde_json::from_str::<SensorData>("null").unwrap(), SensorData::None);
        assert_eq!(serde_json::from_str::<SensorData>("21").unwrap(), SensorData::Int(21));
        assert_eq!(serde_json::from_str::<SensorData>("21.5").unwrap(), SensorData::Float(21.5));
        assert_eq!(SensorData::Float(1.0).data_type(), SensorDataType::Float);
    }

    #[test]
    fn test_ordering_holds() {
        assert!(Ordering::GreaterThan.holds(25.1, 25.0));
        assert!(!Ordering::GreaterThan.holds(25.0, 25.0));
        assert!(Ordering::LessThan.holds(-1.0, 0.0));
        assert!(Ordering::Equal.holds(3.0, 3.0));
        assert_eq!(serde_json::to_string(&Ordering::GreaterThan).unwrap(), "2");
    }
}
