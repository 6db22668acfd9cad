use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    db::Database,
    error::{TripError, TripResult},
    models::{DeviceState, EventLocation, MovementEvent, TransportationState, Trip, TripState},
    repository::{MovementEventRepository, TripRepository},
    settings::TripSettings,
    trip::StartOutcome,
};

use super::{
    commands::MonitorCommand,
    loop_worker::{monitor_loop, MonitorWorker, Publishers},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const COMMAND_QUEUE_DEPTH: usize = 256;
const COMPLETED_BACKLOG: usize = 32;

/// Handle to the trip monitor task. Clones talk to the same task.
///
/// All mutations are queued and applied in order by a single task that owns the
/// state machine, the arbitrator and the telemetry buffer.
#[derive(Clone)]
pub struct TripMonitor {
    commands: mpsc::Sender<MonitorCommand>,
    trips: Arc<dyn TripRepository>,
    events: Arc<dyn MovementEventRepository>,
    is_monitoring: watch::Receiver<bool>,
    trip_state: watch::Receiver<TripState>,
    active_trip: watch::Receiver<Option<Trip>>,
    transportation_state: watch::Receiver<Option<TransportationState>>,
    completed: broadcast::Sender<Trip>,
    cancel_token: CancellationToken,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TripMonitor {
    /// Spawns the monitor task. Must be called from within a tokio runtime.
    pub fn new(
        trips: Arc<dyn TripRepository>,
        events: Arc<dyn MovementEventRepository>,
        settings: watch::Receiver<TripSettings>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (is_monitoring_tx, is_monitoring) = watch::channel(false);
        let (trip_state_tx, trip_state) = watch::channel(TripState::Idle);
        let (active_trip_tx, active_trip) = watch::channel(None);
        let (transportation_state_tx, transportation_state) = watch::channel(None);
        let (completed, _) = broadcast::channel(COMPLETED_BACKLOG);

        let initial = settings.borrow().clone();
        let worker = MonitorWorker::new(
            trips.clone(),
            events.clone(),
            initial,
            Publishers {
                is_monitoring: is_monitoring_tx,
                trip_state: trip_state_tx,
                active_trip: active_trip_tx,
                transportation_state: transportation_state_tx,
                completed: completed.clone(),
            },
        );

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(monitor_loop(
            worker,
            command_rx,
            settings,
            cancel_token.clone(),
        ));

        Self {
            commands,
            trips,
            events,
            is_monitoring,
            trip_state,
            active_trip,
            transportation_state,
            completed,
            cancel_token,
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Monitor backed by the SQLite store for both trips and movement events.
    pub fn with_database(db: Database, settings: watch::Receiver<TripSettings>) -> Self {
        Self::new(Arc::new(db.clone()), Arc::new(db), settings)
    }

    /// Recovers any open trip, then starts consuming detections. Returns the recovered trip.
    pub async fn start_monitoring(&self) -> TripResult<Option<Trip>> {
        self.request(|reply| MonitorCommand::Start { reply }).await?
    }

    /// Stops consuming detections. An open trip is left as is for the next start.
    pub async fn stop_monitoring(&self) -> TripResult<()> {
        self.request(|reply| MonitorCommand::Stop { reply }).await
    }

    pub fn is_monitoring(&self) -> watch::Receiver<bool> {
        self.is_monitoring.clone()
    }

    pub fn current_trip_state(&self) -> watch::Receiver<TripState> {
        self.trip_state.clone()
    }

    pub fn active_trip(&self) -> watch::Receiver<Option<Trip>> {
        self.active_trip.clone()
    }

    /// Latest arbitrated state with its tracking interval multiplier. `None` until a
    /// source reports, and again after monitoring stops.
    pub fn transportation_state(&self) -> watch::Receiver<Option<TransportationState>> {
        self.transportation_state.clone()
    }

    /// Every trip completed from now on, merged trips included.
    pub fn subscribe_completed(&self) -> broadcast::Receiver<Trip> {
        self.completed.subscribe()
    }

    pub async fn force_start_trip(&self) -> TripResult<StartOutcome> {
        self.request(|reply| MonitorCommand::ForceStart { reply })
            .await?
    }

    /// Ends the open trip. `Ok(None)` when there was nothing to end.
    pub async fn force_end_trip(&self) -> TripResult<Option<Trip>> {
        self.request(|reply| MonitorCommand::ForceEnd { reply }).await?
    }

    pub async fn update_location(&self, latitude: f64, longitude: f64) -> TripResult<()> {
        self.update_location_fix(EventLocation {
            latitude,
            longitude,
            accuracy: None,
            speed: None,
        })
        .await
    }

    /// Location update carrying accuracy and speed for the audit trail.
    pub async fn update_location_fix(&self, fix: EventLocation) -> TripResult<()> {
        self.request(|reply| MonitorCommand::Location { fix, reply })
            .await?
    }

    /// Adds distance measured elsewhere. Returns false when `trip_id` is not the open
    /// trip or `meters` is negative.
    pub async fn add_distance(&self, trip_id: &str, meters: f64) -> TripResult<bool> {
        let trip_id = trip_id.to_string();
        self.request(|reply| MonitorCommand::AddDistance {
            trip_id,
            meters,
            reply,
        })
        .await
    }

    pub async fn report(&self, state: TransportationState) -> TripResult<()> {
        self.send(MonitorCommand::Report(state)).await
    }

    /// Forwards every report from `source` until it closes or the monitor shuts down.
    pub fn attach_source(&self, mut source: mpsc::Receiver<TransportationState>) -> JoinHandle<()> {
        let commands = self.commands.clone();
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    report = source.recv() => match report {
                        Some(report) => {
                            if commands.send(MonitorCommand::Report(report)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        })
    }

    pub async fn record_sample(&self, x: f64, y: f64, z: f64) -> TripResult<()> {
        self.send(MonitorCommand::Sample { x, y, z }).await
    }

    pub async fn update_device_state(&self, state: DeviceState) -> TripResult<()> {
        self.send(MonitorCommand::Device(state)).await
    }

    pub async fn get_trip_by_id(&self, id: &str) -> TripResult<Option<Trip>> {
        Ok(self.trips.get_trip_by_id(id).await?)
    }

    pub async fn get_trips_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> TripResult<Vec<Trip>> {
        Ok(self.trips.get_trips_between(from, to).await?)
    }

    pub async fn get_recent_trips(&self, limit: usize) -> TripResult<Vec<Trip>> {
        Ok(self.trips.get_recent_trips(limit).await?)
    }

    pub async fn observe_recent_trips(&self, limit: usize) -> TripResult<watch::Receiver<Vec<Trip>>> {
        Ok(self.trips.observe_recent_trips(limit).await?)
    }

    pub async fn get_events_for_trip(
        &self,
        trip_id: &str,
    ) -> TripResult<Vec<MovementEvent>> {
        Ok(self.events.get_events_for_trip(trip_id).await?)
    }

    /// Stops the monitor task. Open trips stay persisted for recovery.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();

        if let Some(handle) = self.worker.lock().await.take() {
            if let Err(err) = handle.await {
                log_warn!("trip monitor task failed to join: {err}");
            } else {
                log_info!("trip monitor stopped");
            }
        }
    }

    async fn send(&self, command: MonitorCommand) -> TripResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| TripError::MonitorClosed)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> MonitorCommand,
    ) -> TripResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply)).await?;
        rx.await.map_err(|_| TripError::MonitorClosed)
    }
}
