//! Trip aggregate and its mode segments.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::mode::TransportMode;

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripState {
    Idle,
    Active,
    PendingEnd,
    Completed,
}

impl TripState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripState::Idle => "IDLE",
            TripState::Active => "ACTIVE",
            TripState::PendingEnd => "PENDING_END",
            TripState::Completed => "COMPLETED",
        }
    }

    /// ACTIVE and PENDING_END both count towards the single-active-trip rule.
    pub fn is_open(&self) -> bool {
        matches!(self, TripState::Active | TripState::PendingEnd)
    }
}

impl Default for TripState {
    fn default() -> Self {
        TripState::Idle
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripTrigger {
    ModeChange,
    Time,
    Distance,
    Manual,
}

impl TripTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripTrigger::ModeChange => "MODE_CHANGE",
            TripTrigger::Time => "TIME",
            TripTrigger::Distance => "DISTANCE",
            TripTrigger::Manual => "MANUAL",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LatLng {
    pub latitude: f64,
    pub longitude: f64,
}

impl LatLng {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance in meters (haversine).
    pub fn distance_to(&self, other: &LatLng) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_METERS * c
    }
}

/// A contiguous interval inside a trip during which one mode held.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TripModeSegment {
    pub mode: TransportMode,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl TripModeSegment {
    pub fn open(mode: TransportMode, start_time: DateTime<Utc>) -> Self {
        Self {
            mode,
            start_time,
            end_time: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.end_time.is_none()
    }

    /// Zero while open.
    pub fn duration_ms(&self) -> u64 {
        match self.end_time {
            Some(end) => (end - self.start_time).num_milliseconds().max(0) as u64,
            None => 0,
        }
    }

    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        let end = self.end_time.unwrap_or(now);
        (end - self.start_time).num_milliseconds().max(0) as u64
    }

    /// Closes the segment, clamping to a zero-length interval if `at` precedes the start.
    pub fn close(&mut self, at: DateTime<Utc>) -> u64 {
        let end = if at < self.start_time { self.start_time } else { at };
        self.end_time = Some(end);
        self.duration_ms()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: String,
    pub state: TripState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub start_location: Option<LatLng>,
    pub end_location: Option<LatLng>,
    pub total_distance_meters: f64,
    pub location_count: u64,
    pub dominant_mode: TransportMode,
    pub modes_used: BTreeSet<TransportMode>,
    /// Closed-segment milliseconds per mode.
    pub mode_breakdown: BTreeMap<TransportMode, u64>,
    pub segments: Vec<TripModeSegment>,
    pub start_trigger: TripTrigger,
    pub end_trigger: Option<TripTrigger>,
    /// When the candidate end was detected; only set while PENDING_END.
    pub pending_since: Option<DateTime<Utc>>,
    pub is_synced: bool,
    pub synced_at: Option<DateTime<Utc>>,
    pub server_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trip {
    /// Creates an ACTIVE trip with its first segment open.
    pub fn start(
        mode: TransportMode,
        trigger: TripTrigger,
        start_time: DateTime<Utc>,
        start_location: Option<LatLng>,
    ) -> Self {
        let mut trip = Self {
            id: Uuid::new_v4().to_string(),
            state: TripState::Active,
            start_time,
            end_time: None,
            start_location,
            end_location: None,
            total_distance_meters: 0.0,
            location_count: 0,
            dominant_mode: mode,
            modes_used: BTreeSet::new(),
            mode_breakdown: BTreeMap::new(),
            segments: Vec::new(),
            start_trigger: trigger,
            end_trigger: None,
            pending_since: None,
            is_synced: false,
            synced_at: None,
            server_id: None,
            created_at: start_time,
            updated_at: start_time,
        };
        trip.open_segment(mode, start_time);
        trip
    }

    pub fn is_active(&self) -> bool {
        self.state.is_open()
    }

    pub fn open_segment_ref(&self) -> Option<&TripModeSegment> {
        self.segments.last().filter(|segment| segment.is_open())
    }

    pub fn current_mode(&self) -> Option<TransportMode> {
        self.open_segment_ref().map(|segment| segment.mode)
    }

    /// Opens a new segment. Any segment still open is closed at `at` first.
    pub fn open_segment(&mut self, mode: TransportMode, at: DateTime<Utc>) {
        self.close_open_segment(at);
        self.segments.push(TripModeSegment::open(mode, at));
        self.modes_used.insert(mode);
        self.recompute_dominant();
    }

    /// Closes the open segment (if any) and folds its duration into the breakdown.
    pub fn close_open_segment(&mut self, at: DateTime<Utc>) -> Option<u64> {
        let segment = self.segments.last_mut().filter(|segment| segment.is_open())?;
        let mode = segment.mode;
        let duration = segment.close(at);
        *self.mode_breakdown.entry(mode).or_insert(0) += duration;
        self.recompute_dominant();
        Some(duration)
    }

    /// Mode with the greatest accumulated duration. Ties go to the earlier declared
    /// mode; an empty breakdown falls back to the open segment's mode.
    pub fn recompute_dominant(&mut self) {
        self.dominant_mode = dominant_of(&self.mode_breakdown)
            .or_else(|| self.current_mode())
            .unwrap_or_default();
    }

    /// Breakdown including the open segment's elapsed time up to `now`.
    pub fn breakdown_at(&self, now: DateTime<Utc>) -> BTreeMap<TransportMode, u64> {
        let mut breakdown = self.mode_breakdown.clone();
        if let Some(segment) = self.open_segment_ref() {
            *breakdown.entry(segment.mode).or_insert(0) += segment.elapsed_ms(now);
        }
        breakdown
    }

    pub fn closed_segments_ms(&self) -> u64 {
        self.segments.iter().map(TripModeSegment::duration_ms).sum()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0) as u64)
    }

    pub fn average_speed_kmh(&self) -> Option<f64> {
        let duration_ms = self.duration_ms()?;
        if duration_ms == 0 {
            return None;
        }
        let hours = duration_ms as f64 / 3_600_000.0;
        Some(self.total_distance_meters / 1000.0 / hours)
    }

    pub fn is_below_minimum(&self, min_duration_ms: u64, min_distance_meters: f64) -> bool {
        self.duration_ms().unwrap_or(0) < min_duration_ms
            || self.total_distance_meters < min_distance_meters
    }
}

pub fn dominant_of(breakdown: &BTreeMap<TransportMode, u64>) -> Option<TransportMode> {
    // BTreeMap iterates in declaration order, so keeping the first strict maximum
    // resolves ties deterministically.
    let mut best: Option<(TransportMode, u64)> = None;
    for (&mode, &ms) in breakdown {
        match best {
            Some((_, best_ms)) if ms <= best_ms => {}
            _ => best = Some((mode, ms)),
        }
    }
    best.map(|(mode, _)| mode)
}
