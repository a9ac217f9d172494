//! Core types for tsfold

use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in the unit chosen by the writer (milliseconds by default)
pub type Timestamp = i64;

/// Series key: a device and one of its measurements
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Device path (e.g., "root.sg.d1")
    pub device: String,
    /// Measurement name within the device (e.g., "s0")
    pub measurement: String,
}

impl SeriesKey {
    /// Create a new series key
    pub fn new(device: impl Into<String>, measurement: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            measurement: measurement.into(),
        }
    }

    /// Get the size in bytes (approximate)
    pub fn size(&self) -> usize {
        self.device.len() + self.measurement.len()
    }

    /// Full path, device and measurement joined by '.'
    pub fn canonical(&self) -> String {
        format!("{}.{}", self.device, self.measurement)
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.device, self.measurement)
    }
}

/// Value type of a series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    Boolean = 0,
    Int64 = 1,
    Double = 2,
    Text = 3,
}

impl DataType {
    /// Decode from the on-disk tag
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(DataType::Boolean),
            1 => Some(DataType::Int64),
            2 => Some(DataType::Double),
            3 => Some(DataType::Text),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Int64 => "INT64",
            DataType::Double => "DOUBLE",
            DataType::Text => "TEXT",
        };
        f.write_str(name)
    }
}

/// Possible point values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Boolean(bool),
    Int64(i64),
    Double(f64),
    Text(String),
}

impl Value {
    /// Type tag of this value
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Int64(_) => DataType::Int64,
            Value::Double(_) => DataType::Double,
            Value::Text(_) => DataType::Text,
        }
    }

    /// Get the size in bytes
    pub fn size(&self) -> usize {
        match self {
            Value::Boolean(_) => 1,
            Value::Int64(_) => 8,
            Value::Double(_) => 8,
            Value::Text(s) => s.len(),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// One point of a series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeValuePair {
    pub timestamp: Timestamp,
    pub value: Value,
}

impl TimeValuePair {
    /// Create a new point
    pub fn new(timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }

    /// Get the size in bytes (approximate)
    pub fn size(&self) -> usize {
        8 + self.value.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_key() {
        let key = SeriesKey::new("root.sg.d1", "s0");
        assert_eq!(key.canonical(), "root.sg.d1.s0");
        assert_eq!(key.to_string(), "root.sg.d1.s0");

        let other = SeriesKey::new("root.sg.d1", "s1");
        assert!(key < other);
    }

    #[test]
    fn test_data_type_tags() {
        for dt in [
            DataType::Boolean,
            DataType::Int64,
            DataType::Double,
            DataType::Text,
        ] {
            assert_eq!(DataType::from_u8(dt as u8), Some(dt));
        }
        assert_eq!(DataType::from_u8(9), None);
    }

    #[test]
    fn test_value_type() {
        assert_eq!(Value::from(1.5).data_type(), DataType::Double);
        assert_eq!(Value::from(7i64).data_type(), DataType::Int64);
        assert_eq!(TimeValuePair::new(5, "abc").size(), 11);
    }
}
