//! Cooler data model and the cooling mode family.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::curve::PowerCurve;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoolerType {
    Fan,
    Pump,
    Other,
}

/// Which control modes a cooler's hardware accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedCoolingModes {
    pub automatic: bool,
    pub manual: bool,
    pub hardware_curve: bool,
}

/// Power range accepted in manual mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoolerPowerLimits {
    /// Lowest non-zero power the hardware accepts, in percent.
    pub minimum_power: u8,
    /// Whether power 0 switches the cooler off entirely.
    pub can_switch_off: bool,
}

/// Static description of one cooler, as announced by its driver and as
/// persisted between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoolerInfo {
    pub cooler_id: Uuid,
    /// Sensor reporting this cooler's own speed, when the device has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_sensor_id: Option<Uuid>,
    pub kind: CoolerType,
    pub supported_modes: SupportedCoolingModes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_limits: Option<CoolerPowerLimits>,
    /// Sensors the device itself can feed into a hardware curve.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hardware_curve_input_sensor_ids: Vec<Uuid>,
}

/// The active control mode of a cooler.
///
/// Exactly one mode is in force per cooler at any time. Modes are plain serde
/// data so the last requested mode can be persisted and re-applied when the
/// device returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CoolingMode {
    /// The device's own firmware controls the cooler.
    Automatic,
    /// Fixed power, in percent.
    Manual { power: u8 },
    /// Host-evaluated curve over an arbitrary sensor, possibly on another
    /// device. `fallback_power` applies while the sensor is unavailable.
    SoftwareCurve {
        sensor_device_id: Uuid,
        sensor_id: Uuid,
        fallback_power: u8,
        curve: PowerCurve,
    },
    /// Curve handed to the device, evaluated by its firmware over one of its
    /// own sensors.
    HardwareCurve { sensor_id: Uuid, curve: PowerCurve },
}
