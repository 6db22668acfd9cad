use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tokio::{
    sync::{broadcast, mpsc, watch},
    time::{self, Duration, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    arbitration::{ArbitrationConfig, ModeArbitrator},
    error::{TripError, TripResult},
    models::{
        DeviceState, EventLocation, MovementEvent, TransportMode, TransportationState, Trip,
        TripState,
    },
    repository::{MovementEventRepository, TripRepository},
    settings::TripSettings,
    telemetry::TelemetryBuffer,
    trip::TripStateMachine,
};

use super::commands::MonitorCommand;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const REFRESH_INTERVAL_SECS: u64 = 1;
// Far deadlines are re-armed after this long.
const MAX_SLEEP: Duration = Duration::from_secs(3_600);

/// Sending halves of the monitor's observables.
pub(crate) struct Publishers {
    pub is_monitoring: watch::Sender<bool>,
    pub trip_state: watch::Sender<TripState>,
    pub active_trip: watch::Sender<Option<Trip>>,
    pub transportation_state: watch::Sender<Option<TransportationState>>,
    pub completed: broadcast::Sender<Trip>,
}

/// Everything the monitor task owns. Only the task touches it, so no locking.
pub(crate) struct MonitorWorker {
    machine: TripStateMachine,
    arbitrator: ModeArbitrator,
    telemetry: TelemetryBuffer,
    events: Arc<dyn MovementEventRepository>,
    settings: TripSettings,
    device_state: Option<DeviceState>,
    last_fix: Option<EventLocation>,
    monitoring: bool,
    publishers: Publishers,
}

impl MonitorWorker {
    pub(crate) fn new(
        trips: Arc<dyn TripRepository>,
        events: Arc<dyn MovementEventRepository>,
        settings: TripSettings,
        publishers: Publishers,
    ) -> Self {
        Self {
            machine: TripStateMachine::new(trips, settings.clone()),
            arbitrator: ModeArbitrator::new(ArbitrationConfig::from_settings(&settings)),
            telemetry: TelemetryBuffer::new(
                settings.telemetry_capacity,
                settings.telemetry_sample_rate_hz,
            ),
            events,
            settings,
            device_state: None,
            last_fix: None,
            monitoring: false,
            publishers,
        }
    }

    pub(crate) async fn handle(&mut self, command: MonitorCommand) {
        log_debug!("monitor command: {}", command.name());
        let now = now();

        match command {
            MonitorCommand::Start { reply } => {
                let result = self.start(now).await;
                self.publish();
                let _ = reply.send(result);
            }
            MonitorCommand::Stop { reply } => {
                self.stop();
                self.publish();
                let _ = reply.send(());
            }
            MonitorCommand::ForceStart { reply } => {
                let result = self.machine.force_start(now).await;
                self.publish();
                let _ = reply.send(result);
            }
            MonitorCommand::ForceEnd { reply } => {
                let result = self.machine.force_end(now).await;
                if let Ok(Some(trip)) = &result {
                    self.announce_completed(trip);
                }
                self.publish();
                let _ = reply.send(result);
            }
            MonitorCommand::Location { fix, reply } => {
                let result = self.update_location(fix, now).await;
                self.publish();
                let _ = reply.send(result);
            }
            MonitorCommand::AddDistance {
                trip_id,
                meters,
                reply,
            } => {
                let added = self.machine.add_distance(&trip_id, meters, now).await;
                self.publish();
                let _ = reply.send(added);
            }
            MonitorCommand::Report(report) => self.report(report, now).await,
            MonitorCommand::Sample { x, y, z } => self.telemetry.add(x, y, z),
            MonitorCommand::Device(state) => self.device_state = Some(state),
        }

        self.publish();
    }

    /// Instant at which the machine next has deadline work. Suspended while not monitoring.
    pub(crate) fn next_wakeup(&self) -> Option<Instant> {
        if !self.monitoring {
            return None;
        }
        self.machine.next_deadline().map(to_instant)
    }

    pub(crate) async fn fire_deadline(&mut self) {
        match self.machine.on_deadline(now()).await {
            Ok(Some(trip)) => self.announce_completed(&trip),
            Ok(None) => {}
            Err(err) => log_error!("Trip deadline handling failed: {err}"),
        }
        self.publish();
    }

    /// Lets sources that went quiet age out of arbitration.
    pub(crate) async fn refresh_sources(&mut self) {
        // Nothing has been reported since monitoring started: keep any recovered trip as is.
        let Some(previous) = self.arbitrator.current().filter(|_| self.monitoring) else {
            return;
        };
        let now = now();
        if let Some(merged) = self.arbitrator.refresh(now) {
            self.on_arbitrated(previous.mode, merged, now).await;
            self.publish();
        }
    }

    pub(crate) fn apply_settings(&mut self, settings: TripSettings) {
        log_info!(
            "Applying settings (detection {})",
            if settings.detection_enabled { "on" } else { "off" }
        );
        self.machine.apply_settings(settings.clone());
        self.arbitrator
            .set_config(ArbitrationConfig::from_settings(&settings));
        self.telemetry.set_capacity(settings.telemetry_capacity);
        self.telemetry
            .set_sample_rate(settings.telemetry_sample_rate_hz);

        if !settings.detection_enabled && self.monitoring {
            log_info!("Detection disabled, stopping monitoring");
            self.stop();
        }
        self.settings = settings;
        self.publish();
    }

    pub(crate) fn shutdown(&mut self) {
        self.monitoring = false;
        self.publish();
    }

    async fn start(&mut self, now: DateTime<Utc>) -> TripResult<Option<Trip>> {
        if !self.settings.detection_enabled {
            return Err(TripError::DetectionDisabled);
        }
        if self.monitoring {
            return Ok(self.machine.active_trip().cloned());
        }

        let recovered = self.machine.recover(now).await?;
        self.monitoring = true;
        match &recovered {
            Some(trip) => log_info!("Monitoring started, resuming trip {}", trip.id),
            None => log_info!("Monitoring started"),
        }
        Ok(recovered)
    }

    /// Stops consuming detections. An open trip stays persisted as is.
    fn stop(&mut self) {
        if !self.monitoring {
            return;
        }
        self.monitoring = false;
        self.arbitrator.reset();
        log_info!("Monitoring stopped in state {}", self.machine.state().as_str());
    }

    async fn update_location(&mut self, fix: EventLocation, now: DateTime<Utc>) -> TripResult<()> {
        if !self.monitoring {
            log_debug!("Ignoring location while not monitoring");
            return Ok(());
        }
        self.machine
            .on_location(fix.latitude, fix.longitude, now)
            .await?;
        self.last_fix = Some(fix);
        Ok(())
    }

    async fn report(&mut self, report: TransportationState, now: DateTime<Utc>) {
        if !self.monitoring {
            log_debug!(
                "Ignoring {} report from {} while not monitoring",
                report.mode.as_str(),
                report.source.as_str()
            );
            return;
        }
        let previous = self
            .arbitrator
            .current()
            .map_or(TransportMode::Unknown, |state| state.mode);
        if let Some(merged) = self.arbitrator.update(report, now) {
            self.on_arbitrated(previous, merged, now).await;
        }
    }

    async fn on_arbitrated(
        &mut self,
        previous: TransportMode,
        merged: TransportationState,
        now: DateTime<Utc>,
    ) {
        match self.machine.on_mode_change(merged.mode, now).await {
            Ok(Some(completed)) => self.announce_completed(&completed),
            Ok(None) => {}
            Err(err) => log_error!("Failed to apply mode {}: {err}", merged.mode.as_str()),
        }

        if merged.mode != previous {
            self.record_transition(previous, merged, now).await;
        }
    }

    async fn record_transition(
        &self,
        previous: TransportMode,
        merged: TransportationState,
        now: DateTime<Utc>,
    ) {
        let latency_ms = (now - merged.timestamp).num_milliseconds().max(0) as u64;
        let event = MovementEvent {
            id: None,
            timestamp: now,
            trip_id: self.machine.active_trip().map(|trip| trip.id.clone()),
            previous_mode: previous,
            new_mode: merged.mode,
            detection_source: merged.source,
            confidence: merged.confidence,
            detection_latency_ms: latency_ms,
            location: self.last_fix,
            device_state: self.device_state,
            telemetry: (!self.telemetry.is_empty()).then(|| self.telemetry.snapshot()),
            is_synced: false,
            synced_at: None,
        };

        if let Err(err) = self.events.insert_event(&event).await {
            log_warn!(
                "Failed to record transition {} -> {}: {err:#}",
                previous.as_str(),
                merged.mode.as_str()
            );
        }
    }

    fn announce_completed(&self, trip: &Trip) {
        // No subscribers is fine.
        let _ = self.publishers.completed.send(trip.clone());
    }

    fn publish(&self) {
        let publishers = &self.publishers;
        publishers
            .is_monitoring
            .send_if_modified(|current| replace_if_changed(current, self.monitoring));
        publishers
            .trip_state
            .send_if_modified(|current| replace_if_changed(current, self.machine.state()));
        let active = self.machine.active_trip().cloned();
        publishers
            .active_trip
            .send_if_modified(|current| replace_if_changed(current, active));
        let merged = self.arbitrator.current();
        publishers
            .transportation_state
            .send_if_modified(|current| replace_if_changed(current, merged));
    }
}

pub(crate) async fn monitor_loop(
    mut worker: MonitorWorker,
    mut commands: mpsc::Receiver<MonitorCommand>,
    mut settings: watch::Receiver<TripSettings>,
    cancel_token: CancellationToken,
) {
    let mut refresh = time::interval(Duration::from_secs(REFRESH_INTERVAL_SECS));
    refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut settings_open = true;

    loop {
        let wakeup = worker.next_wakeup();

        tokio::select! {
            _ = cancel_token.cancelled() => {
                log_info!("trip monitor shutting down");
                break;
            }
            command = commands.recv() => match command {
                Some(command) => worker.handle(command).await,
                None => {
                    log_info!("trip monitor handles dropped, exiting");
                    break;
                }
            },
            _ = sleep_until(wakeup) => worker.fire_deadline().await,
            _ = refresh.tick() => worker.refresh_sources().await,
            changed = settings.changed(), if settings_open => match changed {
                Ok(()) => {
                    let latest = settings.borrow_and_update().clone();
                    worker.apply_settings(latest);
                }
                Err(_) => {
                    log_warn!("settings feed closed, keeping current settings");
                    settings_open = false;
                }
            },
        }
    }

    worker.shutdown();
}

async fn sleep_until(wakeup: Option<Instant>) {
    match wakeup {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn to_instant(deadline: DateTime<Utc>) -> Instant {
    let wait = (deadline - Utc::now())
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(MAX_SLEEP);
    // Round up so the machine sees a clock at or past the deadline.
    Instant::now() + wait + Duration::from_millis(1)
}

/// Wall clock at millisecond precision, matching what the store keeps.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}
