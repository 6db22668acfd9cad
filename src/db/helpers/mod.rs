use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::models::{NetworkType, SourceId, TransportMode, TripState, TripTrigger};

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

/// Fixed-width UTC text so lexical order matches time order.
pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn format_optional_datetime(value: Option<&DateTime<Utc>>) -> Option<String> {
    value.map(format_datetime)
}

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn parse_mode(value: &str) -> Result<TransportMode> {
    match value {
        "STATIONARY" => Ok(TransportMode::Stationary),
        "WALKING" => Ok(TransportMode::Walking),
        "RUNNING" => Ok(TransportMode::Running),
        "CYCLING" => Ok(TransportMode::Cycling),
        "IN_VEHICLE" => Ok(TransportMode::InVehicle),
        "UNKNOWN" => Ok(TransportMode::Unknown),
        other => Err(anyhow!("unknown transport mode {other}")),
    }
}

pub fn parse_trip_state(value: &str) -> Result<TripState> {
    match value {
        "ACTIVE" => Ok(TripState::Active),
        "PENDING_END" => Ok(TripState::PendingEnd),
        "COMPLETED" => Ok(TripState::Completed),
        other => Err(anyhow!("unknown trip state {other}")),
    }
}

pub fn parse_trigger(value: &str) -> Result<TripTrigger> {
    match value {
        "MODE_CHANGE" => Ok(TripTrigger::ModeChange),
        "TIME" => Ok(TripTrigger::Time),
        "DISTANCE" => Ok(TripTrigger::Distance),
        "MANUAL" => Ok(TripTrigger::Manual),
        other => Err(anyhow!("unknown trip trigger {other}")),
    }
}

pub fn parse_source(value: &str) -> Result<SourceId> {
    match value {
        "ACTIVITY_CLASSIFIER" => Ok(SourceId::ActivityClassifier),
        "VEHICLE_PAIRING" => Ok(SourceId::VehiclePairing),
        "CAR_MODE" => Ok(SourceId::CarMode),
        "SENSOR_FUSION" => Ok(SourceId::SensorFusion),
        "NONE" => Ok(SourceId::None),
        other => Err(anyhow!("unknown detection source {other}")),
    }
}

pub fn parse_network_type(value: &str) -> Result<NetworkType> {
    match value {
        "WIFI" => Ok(NetworkType::Wifi),
        "CELLULAR" => Ok(NetworkType::Cellular),
        "NONE" => Ok(NetworkType::None),
        other => Err(anyhow!("unknown network type {other}")),
    }
}
