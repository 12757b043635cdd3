//! Sensor data model.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire-level type of a sensor's readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorDataType {
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

/// A single sensor reading, tagged with its data type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum SensorValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl SensorValue {
    pub fn data_type(&self) -> SensorDataType {
        match self {
            SensorValue::U8(_) => SensorDataType::U8,
            SensorValue::U16(_) => SensorDataType::U16,
            SensorValue::U32(_) => SensorDataType::U32,
            SensorValue::U64(_) => SensorDataType::U64,
            SensorValue::I8(_) => SensorDataType::I8,
            SensorValue::I16(_) => SensorDataType::I16,
            SensorValue::I32(_) => SensorDataType::I32,
            SensorValue::I64(_) => SensorDataType::I64,
            SensorValue::F32(_) => SensorDataType::F32,
            SensorValue::F64(_) => SensorDataType::F64,
        }
    }

    /// Normalized reading for curve evaluation and display.
    pub fn to_f64(&self) -> f64 {
        match *self {
            SensorValue::U8(v) => v as f64,
            SensorValue::U16(v) => v as f64,
            SensorValue::U32(v) => v as f64,
            SensorValue::U64(v) => v as f64,
            SensorValue::I8(v) => v as f64,
            SensorValue::I16(v) => v as f64,
            SensorValue::I32(v) => v as f64,
            SensorValue::I64(v) => v as f64,
            SensorValue::F32(v) => v as f64,
            SensorValue::F64(v) => v,
        }
    }
}

/// How a sensor's readings are produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorKind {
    /// Value is pushed by the driver itself; not watchable.
    Internal,
    /// Read on demand, one read per scheduler tick.
    Polled,
    /// Read as part of a per-device batched query.
    GroupedPolled,
    /// Driver exposes a native value stream.
    Streamed,
}

/// Static description of one sensor, as announced by its driver and as
/// persisted between sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorInfo {
    pub sensor_id: Uuid,
    pub data_type: SensorDataType,
    pub kind: SensorKind,
    /// Declared lower display bound, if the driver knows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_minimum: Option<SensorValue>,
    /// Declared upper display bound, if the driver knows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_maximum: Option<SensorValue>,
}

/// A timestamped reading as delivered to watchers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorDataPoint {
    pub timestamp: SystemTime,
    pub value: SensorValue,
}

impl SensorDataPoint {
    pub fn now(value: SensorValue) -> Self {
        Self {
            timestamp: SystemTime::now(),
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn value_reports_its_data_type() {
        assert_eq!(SensorValue::U8(3).data_type(), SensorDataType::U8);
        assert_eq!(SensorValue::F64(1.5).data_type(), SensorDataType::F64);
    }

    #[test]
    fn normalization_preserves_magnitude() {
        assert_eq!(SensorValue::I16(-40).to_f64(), -40.0);
        assert_eq!(SensorValue::U64(1_000_000).to_f64(), 1_000_000.0);
        assert_eq!(SensorValue::F32(2.5).to_f64(), 2.5);
    }

    #[test]
    fn sensor_info_round_trips_through_json() {
        let info = SensorInfo {
            sensor_id: Uuid::new_v4(),
            data_type: SensorDataType::F64,
            kind: SensorKind::GroupedPolled,
            scale_minimum: Some(SensorValue::F64(0.0)),
            scale_maximum: Some(SensorValue::F64(100.0)),
        };
        let json = serde_json::to_string(&info).unwrap();
        let back: SensorInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn absent_scale_bounds_are_omitted_from_json() {
        let info = SensorInfo {
            sensor_id: Uuid::nil(),
            data_type: SensorDataType::U8,
            kind: SensorKind::Polled,
            scale_minimum: None,
            scale_maximum: None,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("scale_minimum"));
    }
}
