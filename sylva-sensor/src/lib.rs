//! Sensor lib for the reading value types and raw-value calibration
//! used across the sylva aggregator builds.
//!
//! Readings originate from two kinds of commercial BLE probes: a
//! DFRobot Bluno pH probe (serial-over-GATT, one value per notification)
//! and a Parrot Flower Power multi-sensor soil probe (one characteristic
//! per measured channel). Both are reduced here to a single [`Reading`]
//! shape: a source id, a unix timestamp, and a map of named field values.
//!
//! All calibration math lives in [`transform`] as pure functions so the
//! broker and database layers never touch raw ADC values.

pub mod transform;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use transform::{CodecError, DataTransform};

/// Field name the pH probe reports its measurement under
pub const FIELD_PH: &str = "ph";
/// Field name the pH probe reports its battery level under
pub const FIELD_PH_BATTERY: &str = "bl_battery";
/// Field name the soil probe reports its battery level under
pub const FIELD_SOIL_BATTERY: &str = "pf_batt";

/// The full channel set of the multi-sensor soil probe: five raw
/// channels, six calibrated channels, and the battery level. A record
/// holding all of these is considered complete by consolidation.
pub const SOIL_FIELDS: [&str; 12] = [
    "sunlight",
    "soil_ec",
    "soil_temp",
    "air_temp",
    "vwc",
    "cal_vwc",
    "cal_air_temp",
    "cal_dli",
    "cal_ea",
    "cal_ecb",
    "cal_ec_porous",
    FIELD_SOIL_BATTERY,
];

/// One sampled observation from a single source device.
///
/// `fields` is keyed by measurement name (`ph`, `vwc`, `cal_dli`, ...).
/// A pH probe yields one or two fields per reading; the soil probe
/// yields the whole [`SOIL_FIELDS`] set per sampling burst.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Identifier of the node that produced this reading
    pub source: String,
    /// Unix timestamp (seconds) at which the reading was taken
    pub ts: i64,
    pub fields: BTreeMap<String, f64>,
}

impl Reading {
    pub fn new(source: impl Into<String>, ts: i64) -> Self {
        Self {
            source: source.into(),
            ts,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style insert used by the device drivers
    pub fn with_field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.fields.insert(name.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
