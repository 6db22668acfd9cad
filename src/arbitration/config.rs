use chrono::Duration;

use crate::models::{SourceId, TransportMode, DEFAULT_INTERVAL_MULTIPLIER};
use crate::settings::TripSettings;

/// Configuration for mode arbitration.
#[derive(Debug, Clone)]
pub struct ArbitrationConfig {
    /// Reports older than this are treated as silent
    pub staleness: Duration,

    /// Vehicle-specific sources below this confidence abstain
    pub vehicle_min_confidence: f64,

    /// Tie-break order, highest priority first. Sources missing from the list rank last.
    pub priority: Vec<SourceId>,

    /// Tracking interval multiplier while IN_VEHICLE, clamped to `0.1..=1.0`.
    pub vehicle_interval_multiplier: f64,

    /// Multiplier for every other mode, clamped to `0.1..=2.0`.
    pub default_interval_multiplier: f64,
}

pub const DEFAULT_VEHICLE_INTERVAL_MULTIPLIER: f64 = 0.55;

impl Default for ArbitrationConfig {
    fn default() -> Self {
        Self {
            staleness: Duration::minutes(10),
            vehicle_min_confidence: 0.5,
            priority: vec![
                SourceId::VehiclePairing,
                SourceId::CarMode,
                SourceId::ActivityClassifier,
            ],
            vehicle_interval_multiplier: DEFAULT_VEHICLE_INTERVAL_MULTIPLIER,
            default_interval_multiplier: DEFAULT_INTERVAL_MULTIPLIER,
        }
    }
}

impl ArbitrationConfig {
    pub fn from_settings(settings: &TripSettings) -> Self {
        let mut priority = settings.source_priority.clone();
        if priority.is_empty() {
            priority = Self::default().priority;
        }
        Self {
            staleness: settings.source_staleness(),
            vehicle_min_confidence: settings.vehicle_min_confidence,
            priority,
            vehicle_interval_multiplier: clamp_multiplier(
                settings.vehicle_interval_multiplier,
                1.0,
                DEFAULT_VEHICLE_INTERVAL_MULTIPLIER,
            ),
            default_interval_multiplier: clamp_multiplier(
                settings.default_interval_multiplier,
                2.0,
                DEFAULT_INTERVAL_MULTIPLIER,
            ),
        }
    }

    pub fn interval_multiplier_for(&self, mode: TransportMode) -> f64 {
        match mode {
            TransportMode::InVehicle => self.vehicle_interval_multiplier,
            _ => self.default_interval_multiplier,
        }
    }

    /// Lower is higher priority.
    pub fn rank(&self, source: SourceId) -> usize {
        self.priority
            .iter()
            .position(|candidate| *candidate == source)
            .unwrap_or(self.priority.len())
    }
}

fn clamp_multiplier(value: f64, max: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.1, max)
    } else {
        fallback
    }
}
