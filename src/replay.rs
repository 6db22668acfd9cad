//! JSON-lines driver for the monitor, used by the `tripwise` binary.
//!
//! Each input line is one tagged record, for example
//! `{"type":"mode","mode":"WALKING","confidence":0.9,"source":"ACTIVITY_CLASSIFIER"}`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    models::{DeviceState, EventLocation, SourceId, TransportMode, TransportationState, Trip},
    monitor::TripMonitor,
    trip::StartOutcome,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const RECENT_TRIPS_LIMIT: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReplayRecord {
    #[serde(rename_all = "camelCase")]
    Mode {
        mode: TransportMode,
        #[serde(default = "full_confidence")]
        confidence: f64,
        #[serde(default = "default_source")]
        source: SourceId,
        timestamp: Option<DateTime<Utc>>,
    },
    #[serde(rename_all = "camelCase")]
    Location {
        latitude: f64,
        longitude: f64,
        accuracy: Option<f64>,
        speed: Option<f64>,
    },
    /// Distance for the open trip unless `tripId` names another one.
    #[serde(rename_all = "camelCase")]
    Distance {
        trip_id: Option<String>,
        meters: f64,
    },
    Sample {
        x: f64,
        y: f64,
        z: f64,
    },
    Device(DeviceState),
    /// Pauses the replay so grace periods can run out.
    Wait {
        millis: u64,
    },
    ForceStart,
    ForceEnd,
}

fn full_confidence() -> f64 {
    1.0
}

fn default_source() -> SourceId {
    SourceId::ActivityClassifier
}

/// One line written back for records that produce a result.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ReplayOutput<'a> {
    Started { trip: &'a Trip },
    AlreadyActive { trip: &'a Trip },
    Ended { trip: Option<&'a Trip> },
    Error { line: usize, message: String },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub applied: usize,
    pub rejected: usize,
}

/// Feeds every record from `input` to `monitor`, then writes the most recent trips
/// as a JSON array. Malformed or rejected lines are reported and skipped.
pub async fn replay<R, W>(monitor: &TripMonitor, input: R, output: &mut W) -> Result<ReplaySummary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut summary = ReplaySummary::default();
    let mut line_no = 0;

    while let Some(line) = lines.next_line().await.context("failed to read input")? {
        line_no += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let outcome = match serde_json::from_str::<ReplayRecord>(trimmed) {
            Ok(record) => apply(monitor, record, output).await,
            Err(err) => Err(anyhow::Error::new(err).context("malformed record")),
        };

        match outcome {
            Ok(()) => summary.applied += 1,
            Err(err) => {
                log_warn!("line {line_no} rejected: {err:#}");
                summary.rejected += 1;
                write_line(
                    output,
                    &ReplayOutput::Error {
                        line: line_no,
                        message: format!("{err:#}"),
                    },
                )
                .await?;
            }
        }
    }

    let recent = monitor.get_recent_trips(RECENT_TRIPS_LIMIT).await?;
    let rendered = serde_json::to_string_pretty(&recent)?;
    output.write_all(rendered.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;

    log_info!(
        "replay finished: {} applied, {} rejected, {} recent trips",
        summary.applied,
        summary.rejected,
        recent.len()
    );
    Ok(summary)
}

async fn apply<W>(monitor: &TripMonitor, record: ReplayRecord, output: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    match record {
        ReplayRecord::Mode {
            mode,
            confidence,
            source,
            timestamp,
        } => {
            let at = timestamp.unwrap_or_else(Utc::now);
            monitor
                .report(TransportationState::new(mode, confidence, source, at))
                .await?;
        }
        ReplayRecord::Location {
            latitude,
            longitude,
            accuracy,
            speed,
        } => {
            monitor
                .update_location_fix(EventLocation {
                    latitude,
                    longitude,
                    accuracy,
                    speed,
                })
                .await?;
        }
        ReplayRecord::Distance { trip_id, meters } => {
            let trip_id = match trip_id {
                Some(id) => id,
                None => monitor
                    .active_trip()
                    .borrow()
                    .as_ref()
                    .map(|trip| trip.id.clone())
                    .context("no open trip for distance record")?,
            };
            if !monitor.add_distance(&trip_id, meters).await? {
                anyhow::bail!("distance {meters} not applied to trip {trip_id}");
            }
        }
        ReplayRecord::Sample { x, y, z } => monitor.record_sample(x, y, z).await?,
        ReplayRecord::Device(state) => monitor.update_device_state(state).await?,
        ReplayRecord::Wait { millis } => {
            tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
        }
        ReplayRecord::ForceStart => {
            let outcome = monitor.force_start_trip().await?;
            let rendered = match &outcome {
                StartOutcome::Started(trip) => ReplayOutput::Started { trip },
                StartOutcome::AlreadyActive(trip) => ReplayOutput::AlreadyActive { trip },
            };
            write_line(output, &rendered).await?;
        }
        ReplayRecord::ForceEnd => {
            let ended = monitor.force_end_trip().await?;
            write_line(
                output,
                &ReplayOutput::Ended {
                    trip: ended.as_ref(),
                },
            )
            .await?;
        }
    }
    Ok(())
}

async fn write_line<W>(output: &mut W, value: &ReplayOutput<'_>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut rendered = serde_json::to_vec(value)?;
    rendered.push(b'\n');
    output.write_all(&rendered).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::TripState;
    use crate::settings::TripSettings;
    use pretty_assertions::assert_eq;
    use tokio::sync::watch;

    #[test]
    fn test_records_parse() {
        let mode: ReplayRecord =
            serde_json::from_str(r#"{"type":"mode","mode":"IN_VEHICLE","source":"CAR_MODE"}"#)
                .unwrap();
        assert!(matches!(
            mode,
            ReplayRecord::Mode {
                mode: TransportMode::InVehicle,
                source: SourceId::CarMode,
                confidence,
                timestamp: None,
            } if confidence == 1.0
        ));

        let device: ReplayRecord =
            serde_json::from_str(r#"{"type":"device","batteryLevel":42}"#).unwrap();
        assert!(matches!(
            device,
            ReplayRecord::Device(DeviceState {
                battery_level: Some(42),
                ..
            })
        ));

        assert!(matches!(
            serde_json::from_str::<ReplayRecord>(r#"{"type":"forceEnd"}"#).unwrap(),
            ReplayRecord::ForceEnd
        ));
    }

    #[tokio::test]
    async fn test_replay_builds_trip_and_reports_bad_lines() {
        let db = Database::open_in_memory().unwrap();
        let (_settings_tx, settings_rx) = watch::channel(TripSettings::default());
        let monitor = TripMonitor::with_database(db, settings_rx);
        monitor.start_monitoring().await.unwrap();

        let input = [
            r#"{"type":"location","latitude":0.0,"longitude":0.0}"#,
            r#"{"type":"mode","mode":"CYCLING","confidence":0.9}"#,
            "not json",
            r#"{"type":"location","latitude":0.001,"longitude":0.0}"#,
            r#"{"type":"distance","meters":25.0}"#,
            r#"{"type":"forceEnd"}"#,
            r#"{"type":"location","latitude":91.0,"longitude":0.0}"#,
        ]
        .join("\n");

        let mut output = Vec::new();
        let summary = replay(&monitor, input.as_bytes(), &mut output)
            .await
            .unwrap();

        assert_eq!(
            summary,
            ReplaySummary {
                applied: 5,
                rejected: 2
            }
        );

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains(r#""type":"ended""#));
        assert!(text.contains(r#""line":3"#));

        let trips = monitor.get_recent_trips(10).await.unwrap();
        assert_eq!(trips.len(), 1);
        assert_eq!(trips[0].state, TripState::Completed);
        assert_eq!(trips[0].dominant_mode, TransportMode::Cycling);
        assert!(trips[0].total_distance_meters > 130.0);

        monitor.shutdown().await;
    }
}
