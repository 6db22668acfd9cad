use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row, ToSql};

use crate::{
    db::{
        connection::Database,
        helpers::{
            format_datetime, format_optional_datetime, parse_datetime, parse_mode,
            parse_network_type, parse_optional_datetime, parse_source, to_i64, to_u64,
        },
    },
    models::{DeviceState, EventLocation, MovementEvent, SensorTelemetry},
    repository::MovementEventRepository,
};

const EVENT_COLUMNS: &str = "id, timestamp, trip_id, previous_mode, new_mode, detection_source,
    confidence, detection_latency_ms, latitude, longitude, accuracy, speed, battery_level,
    battery_charging, network_type, network_strength, accelerometer_magnitude,
    accelerometer_variance, accelerometer_peak_frequency, telemetry_sample_count,
    is_synced, synced_at";

fn row_to_event(row: &Row) -> Result<MovementEvent> {
    let timestamp: String = row.get("timestamp")?;
    let previous_mode: String = row.get("previous_mode")?;
    let new_mode: String = row.get("new_mode")?;
    let detection_source: String = row.get("detection_source")?;
    let detection_latency_ms: i64 = row.get("detection_latency_ms")?;
    let synced_at: Option<String> = row.get("synced_at")?;

    let latitude: Option<f64> = row.get("latitude")?;
    let longitude: Option<f64> = row.get("longitude")?;
    let location = match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(EventLocation {
            latitude,
            longitude,
            accuracy: row.get("accuracy")?,
            speed: row.get("speed")?,
        }),
        _ => None,
    };

    let network_type: Option<String> = row.get("network_type")?;
    let device_state = DeviceState {
        battery_level: row.get("battery_level")?,
        battery_charging: row.get("battery_charging")?,
        network_type: network_type.as_deref().map(parse_network_type).transpose()?,
        network_strength: row.get("network_strength")?,
    };
    let device_state = (device_state != DeviceState::default()).then_some(device_state);

    let sample_count: Option<i64> = row.get("telemetry_sample_count")?;
    let telemetry = match sample_count {
        Some(count) => Some(SensorTelemetry {
            accelerometer_magnitude: row.get("accelerometer_magnitude")?,
            accelerometer_variance: row.get("accelerometer_variance")?,
            accelerometer_peak_frequency: row.get("accelerometer_peak_frequency")?,
            sample_count: to_u64(count, "telemetry_sample_count")? as usize,
        }),
        None => None,
    };

    Ok(MovementEvent {
        id: row.get("id")?,
        timestamp: parse_datetime(&timestamp, "timestamp")?,
        trip_id: row.get("trip_id")?,
        previous_mode: parse_mode(&previous_mode)?,
        new_mode: parse_mode(&new_mode)?,
        detection_source: parse_source(&detection_source)?,
        confidence: row.get("confidence")?,
        detection_latency_ms: to_u64(detection_latency_ms, "detection_latency_ms")?,
        location,
        device_state,
        telemetry,
        is_synced: row.get("is_synced")?,
        synced_at: parse_optional_datetime(synced_at, "synced_at")?,
    })
}

fn query_events(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> Result<Vec<MovementEvent>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(args)?;
    let mut events = Vec::new();
    while let Some(row) = rows.next()? {
        events.push(row_to_event(row)?);
    }
    Ok(events)
}

#[async_trait]
impl MovementEventRepository for Database {
    async fn insert_event(&self, event: &MovementEvent) -> Result<i64> {
        let record = event.clone();
        self.execute(move |conn| {
            let location = record.location;
            let device = record.device_state.unwrap_or_default();
            let telemetry = record.telemetry;
            conn.execute(
                "INSERT INTO movement_events (timestamp, trip_id, previous_mode, new_mode, detection_source,
                    confidence, detection_latency_ms, latitude, longitude, accuracy, speed, battery_level,
                    battery_charging, network_type, network_strength, accelerometer_magnitude,
                    accelerometer_variance, accelerometer_peak_frequency, telemetry_sample_count,
                    is_synced, synced_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                params![
                    format_datetime(&record.timestamp),
                    record.trip_id,
                    record.previous_mode.as_str(),
                    record.new_mode.as_str(),
                    record.detection_source.as_str(),
                    record.confidence,
                    to_i64(record.detection_latency_ms)?,
                    location.map(|l| l.latitude),
                    location.map(|l| l.longitude),
                    location.and_then(|l| l.accuracy),
                    location.and_then(|l| l.speed),
                    device.battery_level,
                    device.battery_charging,
                    device.network_type.map(|n| n.as_str()),
                    device.network_strength,
                    telemetry.and_then(|t| t.accelerometer_magnitude),
                    telemetry.and_then(|t| t.accelerometer_variance),
                    telemetry.and_then(|t| t.accelerometer_peak_frequency),
                    telemetry.map(|t| t.sample_count as i64),
                    record.is_synced,
                    format_optional_datetime(record.synced_at.as_ref()),
                ],
            )
            .context("failed to insert movement event")?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn get_events_for_trip(&self, trip_id: &str) -> Result<Vec<MovementEvent>> {
        let trip_id = trip_id.to_string();
        self.execute(move |conn| {
            query_events(
                conn,
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM movement_events
                     WHERE trip_id = ?1
                     ORDER BY timestamp ASC, id ASC"
                ),
                &[&trip_id as &dyn ToSql],
            )
        })
        .await
    }

    async fn get_recent_events(&self, limit: usize) -> Result<Vec<MovementEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.execute(move |conn| {
            query_events(
                conn,
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM movement_events
                     ORDER BY timestamp DESC, id DESC
                     LIMIT ?1"
                ),
                &[&limit as &dyn ToSql],
            )
        })
        .await
    }

    async fn get_unsynced_events(&self, limit: usize) -> Result<Vec<MovementEvent>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.execute(move |conn| {
            query_events(
                conn,
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM movement_events
                     WHERE is_synced = 0
                     ORDER BY timestamp ASC, id ASC
                     LIMIT ?1"
                ),
                &[&limit as &dyn ToSql],
            )
        })
        .await
    }

    async fn mark_events_synced(&self, ids: &[i64], synced_at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "UPDATE movement_events
                     SET is_synced = 1,
                         synced_at = ?1
                     WHERE id = ?2",
                )?;
                let synced_at = format_datetime(&synced_at);
                for id in ids {
                    stmt.execute(params![synced_at, id])?;
                }
            }
            tx.commit().context("failed to commit movement event sync")?;
            Ok(())
        })
        .await
    }
}
