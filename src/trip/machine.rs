use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::{
    error::{TripError, TripResult},
    models::{LatLng, TransportMode, Trip, TripModeSegment, TripState, TripTrigger},
    repository::TripRepository,
    settings::TripSettings,
};

use super::merge::{coalesce, should_merge};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Result of a start request.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(Trip),
    /// A trip was already open (in memory or in the repository); it is returned unchanged.
    AlreadyActive(Trip),
}

impl StartOutcome {
    pub fn trip(&self) -> &Trip {
        match self {
            StartOutcome::Started(trip) | StartOutcome::AlreadyActive(trip) => trip,
        }
    }

    pub fn into_trip(self) -> Trip {
        match self {
            StartOutcome::Started(trip) | StartOutcome::AlreadyActive(trip) => trip,
        }
    }
}

/// A finalization that failed and is waiting to be retried with the same end fields.
#[derive(Debug, Clone, Copy)]
struct PendingFinalize {
    end_time: DateTime<Utc>,
    trigger: TripTrigger,
}

/// Trip lifecycle driven by arbitrated modes, locations and manual commands.
///
/// Owns the in-memory active trip exclusively. Every method takes the current time
/// explicitly; the caller serializes calls.
pub struct TripStateMachine {
    repo: Arc<dyn TripRepository>,
    settings: TripSettings,
    state: TripState,
    trip: Option<Trip>,
    current_mode: TransportMode,
    last_location: Option<LatLng>,
    idle_anchor: Option<LatLng>,
    last_completed: Option<Trip>,
    retry_at: Option<DateTime<Utc>>,
    pending_finalize: Option<PendingFinalize>,
}

impl TripStateMachine {
    pub fn new(repo: Arc<dyn TripRepository>, settings: TripSettings) -> Self {
        Self {
            repo,
            settings,
            state: TripState::Idle,
            trip: None,
            current_mode: TransportMode::Unknown,
            last_location: None,
            idle_anchor: None,
            last_completed: None,
            retry_at: None,
            pending_finalize: None,
        }
    }

    pub fn state(&self) -> TripState {
        self.state
    }

    pub fn active_trip(&self) -> Option<&Trip> {
        self.trip.as_ref()
    }

    pub fn current_mode(&self) -> TransportMode {
        self.current_mode
    }

    pub fn last_location(&self) -> Option<LatLng> {
        self.last_location
    }

    pub fn settings(&self) -> &TripSettings {
        &self.settings
    }

    pub fn apply_settings(&mut self, settings: TripSettings) {
        self.settings = settings;
    }

    /// Adopts any trip left ACTIVE or PENDING_END in the repository.
    ///
    /// A trip already held in memory wins over the stored copy.
    pub async fn recover(&mut self, now: DateTime<Utc>) -> TripResult<Option<Trip>> {
        match self.repo.get_last_completed_trip().await {
            Ok(last) => self.last_completed = last,
            Err(err) => log_warn!("Failed to load last completed trip: {err:#}"),
        }

        if self.trip.is_some() {
            return Ok(self.trip.clone());
        }

        let Some(mut trip) = self.repo.get_active_trip().await? else {
            self.state = TripState::Idle;
            return Ok(None);
        };

        if trip.open_segment_ref().is_none() {
            let mode = trip
                .segments
                .last()
                .map(|segment| segment.mode)
                .unwrap_or(trip.dominant_mode);
            let reopen_at = trip
                .segments
                .last()
                .and_then(|segment| segment.end_time)
                .unwrap_or(trip.start_time)
                .max(trip.updated_at.min(now));
            trip.segments.push(TripModeSegment::open(mode, reopen_at));
            trip.modes_used.insert(mode);
            trip.recompute_dominant();
        }
        if trip.state == TripState::PendingEnd && trip.pending_since.is_none() {
            trip.pending_since = Some(trip.updated_at);
        }

        log_info!(
            "Recovered {} trip {} started at {}",
            trip.state.as_str(),
            trip.id,
            trip.start_time
        );

        self.state = trip.state;
        // A stored PENDING_END trip was last seen at rest.
        self.current_mode = match trip.state {
            TripState::PendingEnd => TransportMode::Unknown,
            _ => trip.current_mode().unwrap_or(trip.dominant_mode),
        };
        self.idle_anchor = None;
        self.trip = Some(trip.clone());
        Ok(Some(trip))
    }

    /// Handles a new arbitrated mode. Returns the trip completed as a side effect, if
    /// an overdue grace period had to be closed first.
    pub async fn on_mode_change(
        &mut self,
        mode: TransportMode,
        at: DateTime<Utc>,
    ) -> TripResult<Option<Trip>> {
        let previous_mode = self.current_mode;
        self.current_mode = mode;
        log_debug!("Mode {} -> {} at {}", previous_mode.as_str(), mode.as_str(), at);

        // A grace period that ran out before this event closes the trip first, so
        // the new movement starts a fresh trip.
        let mut completed = None;
        if self.state == TripState::PendingEnd {
            if let Some(deadline) = self.grace_deadline() {
                if at >= deadline {
                    let (end_time, trigger) = self.finalize_fields(deadline);
                    completed = Some(self.finalize_or_retry(end_time, trigger, at).await?);
                }
            }
        }

        match self.state {
            TripState::Idle | TripState::Completed => {
                if mode.is_moving() {
                    self.start_or_retry(mode, TripTrigger::ModeChange, at).await?;
                }
            }
            TripState::Active => {
                if mode.is_moving() {
                    self.switch_segment(mode, at).await;
                } else {
                    self.enter_pending_end(at).await;
                }
            }
            TripState::PendingEnd => {
                if mode.is_moving() {
                    self.resume(mode, at).await;
                }
            }
        }

        Ok(completed)
    }

    /// Earliest instant at which `on_deadline` has work to do.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        match self.state {
            TripState::PendingEnd => self.retry_at.or_else(|| self.grace_deadline()),
            TripState::Idle if self.current_mode.is_moving() => self.retry_at,
            _ => None,
        }
    }

    /// Fires expired grace periods and scheduled retries. Returns the completed trip.
    pub async fn on_deadline(&mut self, now: DateTime<Utc>) -> TripResult<Option<Trip>> {
        let Some(deadline) = self.next_deadline() else {
            return Ok(None);
        };
        if now < deadline {
            return Ok(None);
        }

        match self.state {
            TripState::PendingEnd => {
                let (end_time, trigger) = self.finalize_fields(self.grace_deadline().unwrap_or(now));
                let completed = self.finalize_or_retry(end_time, trigger, now).await?;

                // Movement reported while the retry was outstanding starts the next trip.
                if self.current_mode.is_moving() {
                    if let Err(err) = self
                        .start_or_retry(self.current_mode, TripTrigger::ModeChange, now)
                        .await
                    {
                        log_warn!("Failed to start trip after retried finalize: {err}");
                    }
                }
                Ok(Some(completed))
            }
            TripState::Idle => {
                log_info!("Retrying trip start for {}", self.current_mode.as_str());
                self.start_or_retry(self.current_mode, TripTrigger::ModeChange, now)
                    .await
                    .map(|_| None)
            }
            _ => Ok(None),
        }
    }

    pub async fn force_start(&mut self, now: DateTime<Utc>) -> TripResult<StartOutcome> {
        let mode = if self.current_mode.is_moving() {
            self.current_mode
        } else {
            TransportMode::Unknown
        };
        self.start_trip(mode, TripTrigger::Manual, now).await
    }

    /// Ends the open trip, adopting one left open in the repository first.
    /// `Ok(None)` when there is nothing to end; no writes happen then.
    pub async fn force_end(&mut self, now: DateTime<Utc>) -> TripResult<Option<Trip>> {
        if self.trip.is_none() && self.recover(now).await?.is_none() {
            return Ok(None);
        }
        if self.state == TripState::Active {
            // A failed write below leaves the trip waiting in PENDING_END.
            self.enter_pending_end(now).await;
        }
        self.finalize_or_retry(now, TripTrigger::Manual, now)
            .await
            .map(Some)
    }

    pub async fn on_location(
        &mut self,
        latitude: f64,
        longitude: f64,
        now: DateTime<Utc>,
    ) -> TripResult<()> {
        let point = LatLng::new(latitude, longitude);
        if !point.is_valid() {
            return Err(TripError::InvalidLocation {
                latitude,
                longitude,
            });
        }

        if self.trip.is_none() {
            let anchor = *self.idle_anchor.get_or_insert(point);
            let threshold = self.settings.distance_start_meters.filter(|m| *m > 0.0);
            match threshold {
                Some(threshold) if anchor.distance_to(&point) >= threshold => {
                    let mode = if self.current_mode.is_moving() {
                        self.current_mode
                    } else {
                        TransportMode::Unknown
                    };
                    self.last_location = Some(anchor);
                    self.start_trip(mode, TripTrigger::Distance, now).await?;
                }
                _ => {
                    self.last_location = Some(point);
                    return Ok(());
                }
            }
        }

        let delta = self
            .last_location
            .map(|previous| previous.distance_to(&point))
            .unwrap_or(0.0);
        self.last_location = Some(point);

        let Some(trip) = self.trip.as_mut() else {
            return Ok(());
        };
        trip.total_distance_meters += delta;
        trip.location_count += 1;
        trip.updated_at = now;

        let seeded_start = trip.start_location.is_none();
        if seeded_start {
            trip.start_location = Some(point);
        }

        let result = if seeded_start {
            self.repo.update(trip).await
        } else {
            self.repo.increment_location_count(&trip.id, delta, now).await
        };
        if let Err(err) = result {
            log_warn!("Failed to persist location for trip {}: {err:#}", trip.id);
        }
        Ok(())
    }

    /// Adds externally measured distance to the open trip as one more fix. Ignored
    /// unless `trip_id` is the open trip and `meters` is a non-negative number.
    pub async fn add_distance(&mut self, trip_id: &str, meters: f64, now: DateTime<Utc>) -> bool {
        if !meters.is_finite() || meters < 0.0 {
            log_warn!("Ignoring invalid distance delta {meters}");
            return false;
        }
        let Some(trip) = self.trip.as_mut().filter(|trip| trip.id == trip_id) else {
            log_debug!("Ignoring distance for trip {trip_id}: not the open trip");
            return false;
        };

        trip.total_distance_meters += meters;
        trip.location_count += 1;
        trip.updated_at = now;
        if let Err(err) = self.repo.increment_location_count(&trip.id, meters, now).await {
            log_warn!("Failed to persist distance for trip {}: {err:#}", trip.id);
        }
        true
    }

    async fn start_or_retry(
        &mut self,
        mode: TransportMode,
        trigger: TripTrigger,
        at: DateTime<Utc>,
    ) -> TripResult<StartOutcome> {
        match self.start_trip(mode, trigger, at).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.retry_at = Some(after(at, self.settings.finalize_retry()));
                Err(err)
            }
        }
    }

    async fn start_trip(
        &mut self,
        mode: TransportMode,
        trigger: TripTrigger,
        at: DateTime<Utc>,
    ) -> TripResult<StartOutcome> {
        if let Some(trip) = &self.trip {
            return Ok(StartOutcome::AlreadyActive(trip.clone()));
        }
        if let Some(existing) = self.repo.get_active_trip().await? {
            log_warn!("Adopting open trip {} instead of starting a new one", existing.id);
            let adopted = self.recover(at).await?.unwrap_or(existing);
            return Ok(StartOutcome::AlreadyActive(adopted));
        }

        let trip = Trip::start(mode, trigger, at, self.last_location);
        self.repo.insert(&trip).await?;

        log_info!(
            "Trip {} started ({}) in {} at {}",
            trip.id,
            trigger.as_str(),
            mode.as_str(),
            at
        );

        self.state = TripState::Active;
        self.trip = Some(trip.clone());
        self.idle_anchor = None;
        self.retry_at = None;
        self.pending_finalize = None;
        Ok(StartOutcome::Started(trip))
    }

    async fn switch_segment(&mut self, mode: TransportMode, at: DateTime<Utc>) {
        let Some(trip) = self.trip.as_mut() else {
            return;
        };
        if trip.current_mode() == Some(mode) {
            return;
        }
        trip.open_segment(mode, at);
        trip.updated_at = at;
        self.persist_progress().await;
    }

    async fn enter_pending_end(&mut self, at: DateTime<Utc>) {
        let Some(trip) = self.trip.as_mut() else {
            return;
        };
        if trip.state == TripState::PendingEnd {
            return;
        }
        let since = trip
            .open_segment_ref()
            .map_or(at, |segment| at.max(segment.start_time));
        trip.state = TripState::PendingEnd;
        trip.pending_since = Some(since);
        trip.updated_at = at;
        self.state = TripState::PendingEnd;

        log_info!(
            "Trip {} pending end, grace {}s",
            trip.id,
            self.settings
                .grace_for(trip.current_mode().unwrap_or(trip.dominant_mode))
                .num_seconds()
        );
        self.persist_progress().await;
    }

    async fn resume(&mut self, mode: TransportMode, at: DateTime<Utc>) {
        let Some(trip) = self.trip.as_mut() else {
            return;
        };
        trip.state = TripState::Active;
        trip.pending_since = None;
        if trip.current_mode() != Some(mode) {
            trip.open_segment(mode, at);
        }
        trip.updated_at = at;
        self.state = TripState::Active;
        self.retry_at = None;
        self.pending_finalize = None;

        log_info!("Trip {} resumed in {}", trip.id, mode.as_str());
        self.persist_progress().await;
    }

    async fn persist_progress(&self) {
        if let Some(trip) = &self.trip {
            if let Err(err) = self.repo.update(trip).await {
                log_warn!("Failed to persist progress for trip {}: {err:#}", trip.id);
            }
        }
    }

    /// End fields for the next finalize attempt: a failed attempt's fields win.
    fn finalize_fields(&self, grace_deadline: DateTime<Utc>) -> (DateTime<Utc>, TripTrigger) {
        match self.pending_finalize {
            Some(pending) => (pending.end_time, pending.trigger),
            None => (grace_deadline, TripTrigger::Time),
        }
    }

    fn grace_deadline(&self) -> Option<DateTime<Utc>> {
        let trip = self.trip.as_ref()?;
        let since = trip.pending_since?;
        let exited = trip.current_mode().unwrap_or(trip.dominant_mode);
        Some(after(since, self.settings.grace_for(exited)))
    }

    async fn finalize_or_retry(
        &mut self,
        end_time: DateTime<Utc>,
        trigger: TripTrigger,
        now: DateTime<Utc>,
    ) -> TripResult<Trip> {
        match self.finalize(end_time, trigger, now).await {
            Ok(trip) => Ok(trip),
            Err(err) => {
                let retry_at = after(now, self.settings.finalize_retry());
                log_error!("Failed to finalize trip, retrying at {retry_at}: {err}");
                self.pending_finalize = Some(PendingFinalize { end_time, trigger });
                self.retry_at = Some(retry_at);
                Err(err)
            }
        }
    }

    /// Closes the open trip. In-memory state only advances once the write succeeds.
    async fn finalize(
        &mut self,
        end_time: DateTime<Utc>,
        trigger: TripTrigger,
        now: DateTime<Utc>,
    ) -> TripResult<Trip> {
        let Some(open) = self.trip.as_ref() else {
            return Err(TripError::NotFound("no open trip to finalize".into()));
        };

        let mut trip = open.clone();
        let end_time = end_time.max(trip.start_time);
        trip.close_open_segment(end_time);
        trip.end_time = Some(end_time);
        trip.end_location = self.last_location;
        trip.end_trigger = Some(trigger);
        trip.state = TripState::Completed;
        trip.pending_since = None;
        trip.updated_at = now;
        trip.recompute_dominant();

        let merge_candidate = self
            .last_completed
            .as_ref()
            .filter(|_| self.settings.auto_merge_enabled)
            .filter(|previous| should_merge(previous, &trip, self.settings.auto_merge_gap()))
            .map(|previous| previous.id.clone());

        // The cached trip may have been edited or deleted since it completed.
        let merge_target = match merge_candidate {
            Some(id) => match self.repo.get_trip_by_id(&id).await? {
                Some(stored)
                    if stored.state == TripState::Completed
                        && should_merge(&stored, &trip, self.settings.auto_merge_gap()) =>
                {
                    Some(stored)
                }
                Some(_) => None,
                None => {
                    log_warn!("Merge target {id} no longer exists, completing {} alone", trip.id);
                    self.last_completed = None;
                    None
                }
            },
            None => None,
        };

        let persisted = match merge_target.as_ref() {
            Some(previous) => {
                let merged = coalesce(previous, &trip, now);
                self.repo.merge_into(&merged, &trip.id).await?;
                log_info!("Trip {} merged into {}", trip.id, merged.id);
                merged
            }
            None => {
                self.repo.update(&trip).await?;
                trip
            }
        };

        if persisted.is_below_minimum(
            self.settings.min_trip_duration_ms(),
            self.settings.min_trip_distance_meters,
        ) {
            log_info!(
                "Trip {} completed below minimum ({}ms, {:.0}m)",
                persisted.id,
                persisted.duration_ms().unwrap_or(0),
                persisted.total_distance_meters
            );
        } else {
            log_info!(
                "Trip {} completed ({}), dominant {}, {:.0}m",
                persisted.id,
                trigger.as_str(),
                persisted.dominant_mode.as_str(),
                persisted.total_distance_meters
            );
        }

        self.trip = None;
        self.state = TripState::Idle;
        self.retry_at = None;
        self.pending_finalize = None;
        self.idle_anchor = self.last_location;
        self.last_completed = Some(persisted.clone());
        Ok(persisted)
    }
}

/// `at + delay`, saturating at the latest representable instant.
fn after(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    at.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}
