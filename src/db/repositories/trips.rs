use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use rusqlite::{params, params_from_iter, Connection, Row, ToSql};
use tokio::sync::watch;

use crate::{
    db::{
        connection::Database,
        helpers::{
            format_datetime, format_optional_datetime, parse_datetime, parse_mode,
            parse_optional_datetime, parse_trigger, parse_trip_state, to_i64, to_u64,
        },
    },
    models::{LatLng, TransportMode, Trip, TripModeSegment},
    repository::TripRepository,
};

const TRIP_COLUMNS: &str = "id, state, start_time, end_time, start_latitude, start_longitude,
    end_latitude, end_longitude, total_distance_meters, location_count, dominant_mode,
    modes_used_json, mode_breakdown_json, start_trigger, end_trigger, pending_since,
    is_synced, synced_at, server_id, created_at, updated_at";

fn location_from(latitude: Option<f64>, longitude: Option<f64>) -> Option<LatLng> {
    match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(LatLng::new(latitude, longitude)),
        _ => None,
    }
}

fn row_to_trip(row: &Row) -> Result<Trip> {
    let state: String = row.get("state")?;
    let start_time: String = row.get("start_time")?;
    let end_time: Option<String> = row.get("end_time")?;
    let location_count: i64 = row.get("location_count")?;
    let dominant_mode: String = row.get("dominant_mode")?;
    let modes_used_json: String = row.get("modes_used_json")?;
    let mode_breakdown_json: String = row.get("mode_breakdown_json")?;
    let start_trigger: String = row.get("start_trigger")?;
    let end_trigger: Option<String> = row.get("end_trigger")?;
    let pending_since: Option<String> = row.get("pending_since")?;
    let synced_at: Option<String> = row.get("synced_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    let modes_used: BTreeSet<TransportMode> =
        serde_json::from_str(&modes_used_json).context("failed to parse modes_used_json")?;
    let mode_breakdown: BTreeMap<TransportMode, u64> = serde_json::from_str(&mode_breakdown_json)
        .context("failed to parse mode_breakdown_json")?;

    Ok(Trip {
        id: row.get("id")?,
        state: parse_trip_state(&state)?,
        start_time: parse_datetime(&start_time, "start_time")?,
        end_time: parse_optional_datetime(end_time, "end_time")?,
        start_location: location_from(row.get("start_latitude")?, row.get("start_longitude")?),
        end_location: location_from(row.get("end_latitude")?, row.get("end_longitude")?),
        total_distance_meters: row.get("total_distance_meters")?,
        location_count: to_u64(location_count, "location_count")?,
        dominant_mode: parse_mode(&dominant_mode)?,
        modes_used,
        mode_breakdown,
        segments: Vec::new(),
        start_trigger: parse_trigger(&start_trigger)?,
        end_trigger: end_trigger.as_deref().map(parse_trigger).transpose()?,
        pending_since: parse_optional_datetime(pending_since, "pending_since")?,
        is_synced: row.get("is_synced")?,
        synced_at: parse_optional_datetime(synced_at, "synced_at")?,
        server_id: row.get("server_id")?,
        created_at: parse_datetime(&created_at, "created_at")?,
        updated_at: parse_datetime(&updated_at, "updated_at")?,
    })
}

fn load_segments(conn: &Connection, trip_id: &str) -> Result<Vec<TripModeSegment>> {
    let mut stmt = conn.prepare(
        "SELECT mode, start_time, end_time
         FROM trip_segments
         WHERE trip_id = ?1
         ORDER BY seq ASC",
    )?;

    let mut rows = stmt.query(params![trip_id])?;
    let mut segments = Vec::new();
    while let Some(row) = rows.next()? {
        let mode: String = row.get(0)?;
        let start_time: String = row.get(1)?;
        let end_time: Option<String> = row.get(2)?;
        segments.push(TripModeSegment {
            mode: parse_mode(&mode)?,
            start_time: parse_datetime(&start_time, "segment start_time")?,
            end_time: parse_optional_datetime(end_time, "segment end_time")?,
        });
    }
    Ok(segments)
}

fn write_segments(conn: &Connection, trip: &Trip) -> Result<()> {
    conn.execute(
        "DELETE FROM trip_segments WHERE trip_id = ?1",
        params![trip.id],
    )?;

    let mut stmt = conn.prepare(
        "INSERT INTO trip_segments (trip_id, seq, mode, start_time, end_time)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (seq, segment) in trip.segments.iter().enumerate() {
        stmt.execute(params![
            trip.id,
            to_i64(seq as u64)?,
            segment.mode.as_str(),
            format_datetime(&segment.start_time),
            format_optional_datetime(segment.end_time.as_ref()),
        ])?;
    }
    Ok(())
}

/// Column values shared by INSERT and UPDATE, in `TRIP_COLUMNS` order minus `id`.
struct TripRow {
    values: Vec<Box<dyn ToSql>>,
}

impl TripRow {
    fn from_trip(trip: &Trip) -> Result<Self> {
        let values: Vec<Box<dyn ToSql>> = vec![
            Box::new(trip.state.as_str()),
            Box::new(format_datetime(&trip.start_time)),
            Box::new(format_optional_datetime(trip.end_time.as_ref())),
            Box::new(trip.start_location.map(|l| l.latitude)),
            Box::new(trip.start_location.map(|l| l.longitude)),
            Box::new(trip.end_location.map(|l| l.latitude)),
            Box::new(trip.end_location.map(|l| l.longitude)),
            Box::new(trip.total_distance_meters),
            Box::new(to_i64(trip.location_count)?),
            Box::new(trip.dominant_mode.as_str()),
            Box::new(serde_json::to_string(&trip.modes_used)?),
            Box::new(serde_json::to_string(&trip.mode_breakdown)?),
            Box::new(trip.start_trigger.as_str()),
            Box::new(trip.end_trigger.map(|t| t.as_str())),
            Box::new(format_optional_datetime(trip.pending_since.as_ref())),
            Box::new(trip.is_synced),
            Box::new(format_optional_datetime(trip.synced_at.as_ref())),
            Box::new(trip.server_id.clone()),
            Box::new(format_datetime(&trip.created_at)),
            Box::new(format_datetime(&trip.updated_at)),
        ];
        Ok(Self { values })
    }
}

fn insert_trip_row(conn: &Connection, trip: &Trip) -> Result<()> {
    let row = TripRow::from_trip(trip)?;
    let mut values: Vec<&dyn ToSql> = vec![&trip.id as &dyn ToSql];
    values.extend(row.values.iter().map(|value| &**value));

    conn.execute(
        &format!(
            "INSERT INTO trips ({TRIP_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
        ),
        params_from_iter(values),
    )
    .with_context(|| format!("failed to insert trip {}", trip.id))?;
    Ok(())
}

fn update_trip_row(conn: &Connection, trip: &Trip) -> Result<usize> {
    let row = TripRow::from_trip(trip)?;
    let mut values: Vec<&dyn ToSql> = row.values.iter().map(|value| &**value).collect();
    values.push(&trip.id);

    let changed = conn
        .execute(
            "UPDATE trips
             SET state = ?1,
                 start_time = ?2,
                 end_time = ?3,
                 start_latitude = ?4,
                 start_longitude = ?5,
                 end_latitude = ?6,
                 end_longitude = ?7,
                 total_distance_meters = ?8,
                 location_count = ?9,
                 dominant_mode = ?10,
                 modes_used_json = ?11,
                 mode_breakdown_json = ?12,
                 start_trigger = ?13,
                 end_trigger = ?14,
                 pending_since = ?15,
                 is_synced = ?16,
                 synced_at = ?17,
                 server_id = ?18,
                 created_at = ?19,
                 updated_at = ?20
             WHERE id = ?21",
            params_from_iter(values),
        )
        .with_context(|| format!("failed to update trip {}", trip.id))?;
    Ok(changed)
}

fn query_trips(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> Result<Vec<Trip>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(args)?;
    let mut trips = Vec::new();
    while let Some(row) = rows.next()? {
        trips.push(row_to_trip(row)?);
    }
    for trip in &mut trips {
        trip.segments = load_segments(conn, &trip.id)?;
    }
    Ok(trips)
}

fn query_one_trip(conn: &Connection, sql: &str, args: &[&dyn ToSql]) -> Result<Option<Trip>> {
    Ok(query_trips(conn, sql, args)?.into_iter().next())
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl TripRepository for Database {
    async fn get_active_trip(&self) -> Result<Option<Trip>> {
        self.execute(|conn| {
            query_one_trip(
                conn,
                &format!(
                    "SELECT {TRIP_COLUMNS} FROM trips
                     WHERE state IN ('ACTIVE', 'PENDING_END')
                     ORDER BY start_time DESC
                     LIMIT 1"
                ),
                &[],
            )
        })
        .await
    }

    async fn insert(&self, trip: &Trip) -> Result<String> {
        let record = trip.clone();
        let id = self
            .execute(move |conn| {
                let tx = conn.transaction()?;
                insert_trip_row(&tx, &record)?;
                write_segments(&tx, &record)?;
                tx.commit().context("failed to commit trip insert")?;
                Ok(record.id)
            })
            .await?;
        self.notify_trips_changed();
        Ok(id)
    }

    async fn update(&self, trip: &Trip) -> Result<()> {
        let record = trip.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            if update_trip_row(&tx, &record)? == 0 {
                bail!("trip {} does not exist", record.id);
            }
            write_segments(&tx, &record)?;
            tx.commit().context("failed to commit trip update")?;
            Ok(())
        })
        .await?;
        self.notify_trips_changed();
        Ok(())
    }

    async fn get_trip_by_id(&self, id: &str) -> Result<Option<Trip>> {
        let id = id.to_string();
        self.execute(move |conn| {
            query_one_trip(
                conn,
                &format!("SELECT {TRIP_COLUMNS} FROM trips WHERE id = ?1"),
                &[&id as &dyn ToSql],
            )
        })
        .await
    }

    async fn get_trips_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Trip>> {
        let from = format_datetime(&from);
        let to = format_datetime(&to);
        self.execute(move |conn| {
            query_trips(
                conn,
                &format!(
                    "SELECT {TRIP_COLUMNS} FROM trips
                     WHERE start_time >= ?1 AND start_time <= ?2
                     ORDER BY start_time ASC"
                ),
                &[&from as &dyn ToSql, &to],
            )
        })
        .await
    }

    async fn get_recent_trips(&self, limit: usize) -> Result<Vec<Trip>> {
        let limit = limit_param(limit);
        self.execute(move |conn| {
            query_trips(
                conn,
                &format!(
                    "SELECT {TRIP_COLUMNS} FROM trips
                     ORDER BY start_time DESC
                     LIMIT ?1"
                ),
                &[&limit as &dyn ToSql],
            )
        })
        .await
    }

    async fn observe_recent_trips(&self, limit: usize) -> Result<watch::Receiver<Vec<Trip>>> {
        let mut changes = self.subscribe_trip_changes();
        let initial = self.get_recent_trips(limit).await?;
        let (tx, rx) = watch::channel(initial);
        let db = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        match db.get_recent_trips(limit).await {
                            Ok(trips) => {
                                if tx.send(trips).is_err() {
                                    break;
                                }
                            }
                            Err(err) => warn!("Failed to refresh recent trips: {err:#}"),
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(rx)
    }

    async fn increment_location_count(
        &self,
        id: &str,
        distance_delta: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        let id = id.to_string();
        let delta = if distance_delta.is_finite() { distance_delta.max(0.0) } else { 0.0 };
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE trips
                 SET location_count = location_count + 1,
                     total_distance_meters = total_distance_meters + ?1,
                     updated_at = ?2
                 WHERE id = ?3 AND state IN ('ACTIVE', 'PENDING_END')",
                params![delta, format_datetime(&updated_at), id],
            )?;
            if changed == 0 {
                bail!("no open trip {id} to count location for");
            }
            Ok(())
        })
        .await?;
        self.notify_trips_changed();
        Ok(())
    }

    async fn get_last_completed_trip(&self) -> Result<Option<Trip>> {
        self.execute(|conn| {
            query_one_trip(
                conn,
                &format!(
                    "SELECT {TRIP_COLUMNS} FROM trips
                     WHERE state = 'COMPLETED'
                     ORDER BY end_time DESC
                     LIMIT 1"
                ),
                &[],
            )
        })
        .await
    }

    async fn merge_into(&self, merged: &Trip, absorbed_id: &str) -> Result<()> {
        let record = merged.clone();
        let absorbed_id = absorbed_id.to_string();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            // Re-point events first so the delete below does not null their link.
            tx.execute(
                "UPDATE movement_events SET trip_id = ?1 WHERE trip_id = ?2",
                params![record.id, absorbed_id],
            )?;
            tx.execute("DELETE FROM trips WHERE id = ?1", params![absorbed_id])?;
            if update_trip_row(&tx, &record)? == 0 {
                bail!("merge target trip {} does not exist", record.id);
            }
            write_segments(&tx, &record)?;
            tx.commit().context("failed to commit trip merge")?;
            Ok(())
        })
        .await?;
        self.notify_trips_changed();
        Ok(())
    }

    async fn get_unsynced_trips(&self, limit: usize) -> Result<Vec<Trip>> {
        let limit = limit_param(limit);
        self.execute(move |conn| {
            query_trips(
                conn,
                &format!(
                    "SELECT {TRIP_COLUMNS} FROM trips
                     WHERE state = 'COMPLETED' AND is_synced = 0
                     ORDER BY start_time ASC
                     LIMIT ?1"
                ),
                &[&limit as &dyn ToSql],
            )
        })
        .await
    }

    async fn mark_trip_synced(
        &self,
        id: &str,
        server_id: Option<String>,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        let id = id.to_string();
        self.execute(move |conn| {
            let changed = conn.execute(
                "UPDATE trips
                 SET is_synced = 1,
                     synced_at = ?1,
                     server_id = COALESCE(?2, server_id)
                 WHERE id = ?3",
                params![format_datetime(&synced_at), server_id, id],
            )?;
            if changed == 0 {
                bail!("trip {id} does not exist");
            }
            Ok(())
        })
        .await?;
        self.notify_trips_changed();
        Ok(())
    }
}
