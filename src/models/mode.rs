use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Coarse transportation mode. Declaration order doubles as the tie-break
/// order for dominant-mode selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportMode {
    Stationary,
    Walking,
    Running,
    Cycling,
    InVehicle,
    Unknown,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Stationary => "STATIONARY",
            TransportMode::Walking => "WALKING",
            TransportMode::Running => "RUNNING",
            TransportMode::Cycling => "CYCLING",
            TransportMode::InVehicle => "IN_VEHICLE",
            TransportMode::Unknown => "UNKNOWN",
        }
    }

    /// Modes that open or sustain a trip.
    pub fn is_moving(&self) -> bool {
        matches!(
            self,
            TransportMode::Walking
                | TransportMode::Running
                | TransportMode::Cycling
                | TransportMode::InVehicle
        )
    }
}

impl Default for TransportMode {
    fn default() -> Self {
        TransportMode::Unknown
    }
}

/// Identity of a detection source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceId {
    ActivityClassifier,
    VehiclePairing,
    CarMode,
    /// Merged state backed by more than one source agreeing on IN_VEHICLE.
    /// Arbitration output only; reports claiming it are dropped.
    SensorFusion,
    /// Only used by the merged state when no source is fresh.
    None,
}

impl SourceId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::ActivityClassifier => "ACTIVITY_CLASSIFIER",
            SourceId::VehiclePairing => "VEHICLE_PAIRING",
            SourceId::CarMode => "CAR_MODE",
            SourceId::SensorFusion => "SENSOR_FUSION",
            SourceId::None => "NONE",
        }
    }

    /// Sources that can only ever assert IN_VEHICLE.
    pub fn is_vehicle_specific(&self) -> bool {
        matches!(self, SourceId::VehiclePairing | SourceId::CarMode)
    }

    /// Identities only arbitration may emit.
    pub fn is_derived(&self) -> bool {
        matches!(self, SourceId::SensorFusion | SourceId::None)
    }
}

pub const DEFAULT_INTERVAL_MULTIPLIER: f64 = 1.0;

/// A single report from one detection source, or the arbitrated result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportationState {
    pub mode: TransportMode,
    pub confidence: f64,
    pub source: SourceId,
    pub timestamp: DateTime<Utc>,
    /// Scales the location tracking interval while in this mode. Set by arbitration;
    /// raw reports carry the neutral value.
    #[serde(default = "default_interval_multiplier")]
    pub interval_multiplier: f64,
}

fn default_interval_multiplier() -> f64 {
    DEFAULT_INTERVAL_MULTIPLIER
}

impl TransportationState {
    pub fn new(
        mode: TransportMode,
        confidence: f64,
        source: SourceId,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            mode,
            confidence: confidence.clamp(0.0, 1.0),
            source,
            timestamp,
            interval_multiplier: DEFAULT_INTERVAL_MULTIPLIER,
        }
    }

    pub fn unknown(timestamp: DateTime<Utc>) -> Self {
        Self {
            mode: TransportMode::Unknown,
            confidence: 0.0,
            source: SourceId::None,
            timestamp,
            interval_multiplier: DEFAULT_INTERVAL_MULTIPLIER,
        }
    }

    /// Tracking interval for this mode, never below one minute.
    pub fn adjusted_interval(&self, base: Duration) -> Duration {
        let scaled = base.num_seconds() as f64 * self.interval_multiplier;
        // `as` saturates and maps NaN to zero.
        Duration::seconds(scaled as i64).max(Duration::minutes(1))
    }
}
