//! Bluetooth LE advertising decoders.
//!
//! Only passively broadcast payloads are handled here; devices needing a
//! connection have their own managers.

use gw_protocol::{DeviceID, ModuleID, SensorData, SensorValue};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BleError {
    #[error("protocol error: {0}")]
    Protocol(String),
}

// ---------------------------------------------------------------------------
// BeeWi SmartClim
// ---------------------------------------------------------------------------

const TEMPERATURE_MODULE: ModuleID = ModuleID(0);
const HUMIDITY_MODULE: ModuleID = ModuleID(1);
const BATTERY_MODULE: ModuleID = ModuleID(2);

/// Temperature/humidity sensor broadcasting its readings in the
/// advertising payload:
///
/// ```text
/// | ID (1 B) | 1 B | temperature (2 B) | 1 B | humidity (1 B) | 4 B | battery (1 B) |
/// ```
pub struct BeeWiSmartClim {
    device_id: DeviceID,
}

impl BeeWiSmartClim {
    pub const NAME: &'static str = "BeeWi SmartClim";

    pub fn new(device_id: DeviceID) -> BeeWiSmartClim {
        BeeWiSmartClim { device_id }
    }

    pub fn device_id(&self) -> DeviceID {
        self.device_id
    }

    /// Whether a scanned model identifier belongs to this product.
    pub fn matches_model(model_id: &str) -> bool {
        model_id.contains("BeeWi BBW200")
    }

    /// Decode one advertising payload into readings.
    pub fn parse_advertising_data(&self, data: &[u8]) -> Result<SensorData, BleError> {
        if data.len() != 11 {
            return Err(BleError::Protocol(format!(
                "expected 11 B, received {} B",
                data.len()
            )));
        }

        // 0xff in the high byte marks the negative range
        let temperature = if data[3] == 255 {
            (f64::from(data[2]) - f64::from(data[3])) / 10.0
        } else {
            f64::from(u16::from(data[2]) + (u16::from(data[3]) << 8)) / 10.0
        };
        let humidity = f64::from(data[5]);
        let battery = f64::from(data[10]);

        Ok(SensorData::now(
            self.device_id,
            vec![
                SensorValue {
                    module_id: TEMPERATURE_MODULE,
                    value: Some(temperature),
                },
                SensorValue {
                    module_id: HUMIDITY_MODULE,
                    value: Some(humidity),
                },
                SensorValue {
                    module_id: BATTERY_MODULE,
                    value: Some(battery),
                },
            ],
        ))
    }
}
