//! Measured sensor values and their JSON form.
//!
//! The serialized shape is frozen — persisted buffer entries and
//! `sensor_data_export` payloads both use it:
//!
//! ```json
//! {"device_id":"0x4100000001020304",
//!  "timestamp":1527660187000000,
//!  "data":[{"module_id":0,"value":5.0},{"module_id":2}]}
//! ```
//!
//! `timestamp` is integer microseconds since the Unix epoch.  A missing or
//! `null` value means "no reading"; NaN and infinities serialize as `null`.

use crate::device::{DeviceID, ModuleID};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// SensorValue
// ---------------------------------------------------------------------------

/// One reading of one module; `None` means the module had no valid reading.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorValue {
    pub module_id: ModuleID,
    #[serde(default)]
    pub value: Option<f64>,
}

impl SensorValue {
    pub fn new(module_id: impl Into<ModuleID>, value: f64) -> SensorValue {
        SensorValue {
            module_id: module_id.into(),
            value: Some(value),
        }
    }

    pub fn invalid(module_id: impl Into<ModuleID>) -> SensorValue {
        SensorValue {
            module_id: module_id.into(),
            value: None,
        }
    }

    /// True when the value is present and finite.
    pub fn is_valid(&self) -> bool {
        self.value.is_some_and(f64::is_finite)
    }
}

impl Serialize for SensorValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // The `value` key is omitted for missing readings and explicitly
        // null for non-finite ones.
        let has_value = self.value.is_some();
        let mut s = serializer.serialize_struct("SensorValue", 1 + usize::from(has_value))?;
        s.serialize_field("module_id", &self.module_id)?;
        if let Some(v) = self.value {
            if v.is_finite() {
                s.serialize_field("value", &v)?;
            } else {
                s.serialize_field("value", &Option::<f64>::None)?;
            }
        }
        s.end()
    }
}

// ---------------------------------------------------------------------------
// SensorData
// ---------------------------------------------------------------------------

/// A batch of readings from one device at one instant.  Immutable once
/// shipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorData {
    pub device_id: DeviceID,
    /// Microseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(rename = "data")]
    pub values: Vec<SensorValue>,
}

impl SensorData {
    pub fn new(device_id: DeviceID, timestamp: u64, values: Vec<SensorValue>) -> SensorData {
        SensorData {
            device_id,
            timestamp,
            values,
        }
    }

    /// Readings stamped with the current wall-clock time.
    pub fn now(device_id: DeviceID, values: Vec<SensorValue>) -> SensorData {
        SensorData::new(device_id, timestamp_micros(SystemTime::now()), values)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Microseconds since the Unix epoch for the given instant.
pub fn timestamp_micros(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
