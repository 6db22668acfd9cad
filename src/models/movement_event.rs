use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::mode::{SourceId, TransportMode};

const LOW_BATTERY_PERCENT: u8 = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkType {
    Wifi,
    Cellular,
    None,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Wifi => "WIFI",
            NetworkType::Cellular => "CELLULAR",
            NetworkType::None => "NONE",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceState {
    pub battery_level: Option<u8>,
    pub battery_charging: Option<bool>,
    pub network_type: Option<NetworkType>,
    pub network_strength: Option<i32>,
}

impl DeviceState {
    pub fn is_low_battery(&self) -> bool {
        matches!(self.battery_level, Some(level) if level < LOW_BATTERY_PERCENT)
            && self.battery_charging != Some(true)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
}

/// Accelerometer statistics captured at the moment of a transition.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SensorTelemetry {
    pub accelerometer_magnitude: Option<f64>,
    pub accelerometer_variance: Option<f64>,
    pub accelerometer_peak_frequency: Option<f64>,
    pub sample_count: usize,
}

/// Append-only audit record of an accepted mode transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MovementEvent {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub trip_id: Option<String>,
    pub previous_mode: TransportMode,
    pub new_mode: TransportMode,
    pub detection_source: SourceId,
    pub confidence: f64,
    pub detection_latency_ms: u64,
    pub location: Option<EventLocation>,
    pub device_state: Option<DeviceState>,
    pub telemetry: Option<SensorTelemetry>,
    pub is_synced: bool,
    pub synced_at: Option<DateTime<Utc>>,
}
