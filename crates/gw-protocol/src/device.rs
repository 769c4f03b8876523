//! Device identity types.
//!
//! A `DeviceID` is a 64-bit opaque identifier whose top byte is the
//! technology prefix of the device.  The canonical text form is `0x`
//! followed by 16 lowercase hex digits; JSON and persisted buffer entries
//! both use this form.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// DevicePrefix
// ---------------------------------------------------------------------------

/// Technology tag carried in the top byte of a `DeviceID`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DevicePrefix {
    Fitp,
    PressureSensor,
    VirtualDevice,
    Bluetooth,
    Zwave,
    Iqrf,
    /// Unrecognized prefix byte; kept verbatim so IDs round-trip.
    Unknown(u8),
}

impl DevicePrefix {
    pub fn from_byte(b: u8) -> DevicePrefix {
        match b {
            0xa1 => DevicePrefix::Fitp,
            0xa2 => DevicePrefix::PressureSensor,
            0xa3 => DevicePrefix::VirtualDevice,
            0xa6 => DevicePrefix::Bluetooth,
            0xa8 => DevicePrefix::Zwave,
            0x41 => DevicePrefix::Iqrf,
            other => DevicePrefix::Unknown(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            DevicePrefix::Fitp => 0xa1,
            DevicePrefix::PressureSensor => 0xa2,
            DevicePrefix::VirtualDevice => 0xa3,
            DevicePrefix::Bluetooth => 0xa6,
            DevicePrefix::Zwave => 0xa8,
            DevicePrefix::Iqrf => 0x41,
            DevicePrefix::Unknown(b) => b,
        }
    }

    fn name(self) -> &'static str {
        match self {
            DevicePrefix::Fitp => "fitp",
            DevicePrefix::PressureSensor => "pressure",
            DevicePrefix::VirtualDevice => "virtual",
            DevicePrefix::Bluetooth => "bluetooth",
            DevicePrefix::Zwave => "zwave",
            DevicePrefix::Iqrf => "iqrf",
            DevicePrefix::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for DevicePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DevicePrefix::Unknown(b) => write!(f, "unknown(0x{b:02x})"),
            other => f.write_str(other.name()),
        }
    }
}

impl FromStr for DevicePrefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fitp" => Ok(DevicePrefix::Fitp),
            "pressure" => Ok(DevicePrefix::PressureSensor),
            "virtual" => Ok(DevicePrefix::VirtualDevice),
            "bluetooth" => Ok(DevicePrefix::Bluetooth),
            "zwave" => Ok(DevicePrefix::Zwave),
            "iqrf" => Ok(DevicePrefix::Iqrf),
            other => Err(format!("unrecognized device prefix '{other}'")),
        }
    }
}

impl Serialize for DevicePrefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for DevicePrefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// DeviceID
// ---------------------------------------------------------------------------

/// 64-bit device identifier, totally ordered by numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceID(u64);

impl DeviceID {
    /// Compose an ID from a prefix and the lower 56 identity bits.
    pub fn new(prefix: DevicePrefix, ident: u64) -> DeviceID {
        DeviceID((u64::from(prefix.as_byte()) << 56) | (ident & 0x00ff_ffff_ffff_ffff))
    }

    pub fn from_raw(raw: u64) -> DeviceID {
        DeviceID(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn prefix(self) -> DevicePrefix {
        DevicePrefix::from_byte((self.0 >> 56) as u8)
    }

    pub fn ident(self) -> u64 {
        self.0 & 0x00ff_ffff_ffff_ffff
    }
}

impl fmt::Display for DeviceID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl FromStr for DeviceID {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix("0x")
            .ok_or_else(|| format!("device ID '{s}' must start with 0x"))?;
        if hex.len() != 16 {
            return Err(format!("device ID '{s}' must have 16 hex digits"));
        }
        u64::from_str_radix(hex, 16)
            .map(DeviceID)
            .map_err(|e| format!("device ID '{s}': {e}"))
    }
}

impl Serialize for DeviceID {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DeviceID {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// ModuleID
// ---------------------------------------------------------------------------

/// Index of a logical channel (sensor or actuator) within a device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ModuleID(pub u32);

impl fmt::Display for ModuleID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ModuleID {
    fn from(raw: u32) -> Self {
        ModuleID(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_text_form_round_trips() {
        let id = DeviceID::new(DevicePrefix::Iqrf, 0x0102_0304);
        assert_eq!(id.to_string(), "0x4100000001020304");
        assert_eq!("0x4100000001020304".parse::<DeviceID>().unwrap(), id);
        assert_eq!(id.prefix(), DevicePrefix::Iqrf);
    }

    #[test]
    fn device_id_rejects_malformed_text() {
        assert!("4100000001020304".parse::<DeviceID>().is_err());
        assert!("0x41000000010203".parse::<DeviceID>().is_err());
        assert!("0x41000000010203zz".parse::<DeviceID>().is_err());
    }

    #[test]
    fn prefix_of_top_byte() {
        let id = DeviceID::from_raw(0xa300_0000_0000_0001);
        assert_eq!(id.prefix(), DevicePrefix::VirtualDevice);

        let id = DeviceID::from_raw(0x1e00_0000_0000_0001);
        assert_eq!(id.prefix(), DevicePrefix::Unknown(0x1e));
    }

    #[test]
    fn ordering_is_numeric() {
        let a = DeviceID::from_raw(0x4100_0000_0000_0001);
        let b = DeviceID::from_raw(0xa600_0000_0000_0000);
        assert!(a < b);
    }
}
