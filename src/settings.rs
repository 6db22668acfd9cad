use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};
use tokio::sync::watch;

use crate::arbitration::config::DEFAULT_VEHICLE_INTERVAL_MULTIPLIER;
use crate::models::{SourceId, TransportMode, DEFAULT_INTERVAL_MULTIPLIER};

/// Tunables for arbitration and the trip lifecycle. Every field has a default so
/// partial settings files load cleanly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TripSettings {
    pub detection_enabled: bool,

    /// Grace periods applied when leaving each moving mode.
    pub walking_grace_secs: u64,
    pub running_grace_secs: u64,
    pub cycling_grace_secs: u64,
    pub vehicle_grace_secs: u64,

    /// Trips under either threshold are still persisted, only flagged.
    pub min_trip_duration_secs: u64,
    pub min_trip_distance_meters: f64,

    pub auto_merge_enabled: bool,
    pub auto_merge_gap_secs: u64,

    pub source_staleness_secs: u64,
    pub vehicle_min_confidence: f64,
    /// Highest priority first.
    pub source_priority: Vec<SourceId>,

    /// Tracking interval multipliers published with the arbitrated state.
    pub vehicle_interval_multiplier: f64,
    pub default_interval_multiplier: f64,

    /// Start a trip after this much displacement from the idle position.
    pub distance_start_meters: Option<f64>,
    pub finalize_retry_secs: u64,

    pub telemetry_capacity: usize,
    pub telemetry_sample_rate_hz: f64,
}

impl Default for TripSettings {
    fn default() -> Self {
        Self {
            detection_enabled: true,
            walking_grace_secs: 60,
            running_grace_secs: 60,
            cycling_grace_secs: 60,
            vehicle_grace_secs: 90,
            min_trip_duration_secs: 120,
            min_trip_distance_meters: 100.0,
            auto_merge_enabled: true,
            auto_merge_gap_secs: 300,
            source_staleness_secs: 600,
            vehicle_min_confidence: 0.5,
            source_priority: vec![
                SourceId::VehiclePairing,
                SourceId::CarMode,
                SourceId::ActivityClassifier,
            ],
            vehicle_interval_multiplier: DEFAULT_VEHICLE_INTERVAL_MULTIPLIER,
            default_interval_multiplier: DEFAULT_INTERVAL_MULTIPLIER,
            distance_start_meters: None,
            finalize_retry_secs: 30,
            telemetry_capacity: 250,
            telemetry_sample_rate_hz: 50.0,
        }
    }
}

impl TripSettings {
    /// Grace period for leaving `mode`. Non-moving modes fall back to the walking grace.
    pub fn grace_for(&self, mode: TransportMode) -> Duration {
        let secs = match mode {
            TransportMode::InVehicle => self.vehicle_grace_secs,
            TransportMode::Running => self.running_grace_secs,
            TransportMode::Cycling => self.cycling_grace_secs,
            TransportMode::Walking
            | TransportMode::Stationary
            | TransportMode::Unknown => self.walking_grace_secs,
        };
        secs_to_duration(secs)
    }

    pub fn min_trip_duration_ms(&self) -> u64 {
        self.min_trip_duration_secs.saturating_mul(1000)
    }

    pub fn auto_merge_gap(&self) -> Duration {
        secs_to_duration(self.auto_merge_gap_secs)
    }

    pub fn source_staleness(&self) -> Duration {
        secs_to_duration(self.source_staleness_secs)
    }

    pub fn finalize_retry(&self) -> Duration {
        secs_to_duration(self.finalize_retry_secs.max(1))
    }
}

/// Upper bound for every configured interval: one day.
pub const MAX_INTERVAL_SECS: u64 = 86_400;

fn secs_to_duration(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_INTERVAL_SECS) as i64)
}

/// JSON-file backed settings with a `watch` feed for hot reload.
pub struct SettingsStore {
    path: PathBuf,
    tx: watch::Sender<TripSettings>,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_default()
        } else {
            TripSettings::default()
        };

        let (tx, _rx) = watch::channel(data);
        Ok(Self { path, tx })
    }

    pub fn current(&self) -> TripSettings {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TripSettings> {
        self.tx.subscribe()
    }

    pub fn update(&self, settings: TripSettings) -> Result<()> {
        self.persist(&settings)?;
        self.tx.send_replace(settings);
        Ok(())
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read settings from {}", self.path.display()))?;
        let data: TripSettings = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid settings in {}", self.path.display()))?;
        self.tx.send_replace(data);
        Ok(())
    }

    fn persist(&self, data: &TripSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create settings directory {}", parent.display())
                })?;
            }
        }
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }
}
