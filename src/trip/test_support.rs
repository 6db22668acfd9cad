//! In-memory repositories with failure injection for engine tests.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::models::{MovementEvent, Trip, TripState};
use crate::repository::{MovementEventRepository, TripRepository};

#[derive(Default)]
pub struct MemoryRepository {
    trips: Mutex<Vec<Trip>>,
    events: Mutex<Vec<MovementEvent>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trips(trips: Vec<Trip>) -> Self {
        let repo = Self::default();
        *repo.trips.lock().unwrap() = trips;
        repo
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn all_trips(&self) -> Vec<Trip> {
        self.trips.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.trips
            .lock()
            .unwrap()
            .iter()
            .filter(|trip| trip.state.is_open())
            .count()
    }

    /// Removes a trip the way a user-initiated delete would, outside the engine.
    pub fn delete_trip(&self, id: &str) {
        self.trips.lock().unwrap().retain(|trip| trip.id != id);
    }

    pub fn events(&self) -> Vec<MovementEvent> {
        self.events.lock().unwrap().clone()
    }

    fn begin_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("injected write failure");
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl TripRepository for MemoryRepository {
    async fn get_active_trip(&self) -> Result<Option<Trip>> {
        Ok(self
            .trips
            .lock()
            .unwrap()
            .iter()
            .find(|trip| trip.state.is_open())
            .cloned())
    }

    async fn insert(&self, trip: &Trip) -> Result<String> {
        self.begin_write()?;
        let mut trips = self.trips.lock().unwrap();
        if trip.state.is_open() && trips.iter().any(|t| t.state.is_open()) {
            bail!("an open trip already exists");
        }
        trips.push(trip.clone());
        Ok(trip.id.clone())
    }

    async fn update(&self, trip: &Trip) -> Result<()> {
        self.begin_write()?;
        let mut trips = self.trips.lock().unwrap();
        let slot = trips
            .iter_mut()
            .find(|t| t.id == trip.id)
            .ok_or_else(|| anyhow!("trip {} does not exist", trip.id))?;
        *slot = trip.clone();
        Ok(())
    }

    async fn get_trip_by_id(&self, id: &str) -> Result<Option<Trip>> {
        Ok(self.trips.lock().unwrap().iter().find(|t| t.id == id).cloned())
    }

    async fn get_trips_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Trip>> {
        let mut trips: Vec<Trip> = self
            .trips
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.start_time >= from && t.start_time <= to)
            .cloned()
            .collect();
        trips.sort_by_key(|t| t.start_time);
        Ok(trips)
    }

    async fn get_recent_trips(&self, limit: usize) -> Result<Vec<Trip>> {
        let mut trips = self.trips.lock().unwrap().clone();
        trips.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        trips.truncate(limit);
        Ok(trips)
    }

    async fn observe_recent_trips(&self, limit: usize) -> Result<watch::Receiver<Vec<Trip>>> {
        let (_tx, rx) = watch::channel(self.get_recent_trips(limit).await?);
        Ok(rx)
    }

    async fn increment_location_count(
        &self,
        id: &str,
        distance_delta: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        self.begin_write()?;
        let mut trips = self.trips.lock().unwrap();
        let trip = trips
            .iter_mut()
            .find(|t| t.id == id && t.state.is_open())
            .ok_or_else(|| anyhow!("no open trip {id}"))?;
        trip.location_count += 1;
        trip.total_distance_meters += distance_delta.max(0.0);
        trip.updated_at = updated_at;
        Ok(())
    }

    async fn get_last_completed_trip(&self) -> Result<Option<Trip>> {
        Ok(self
            .trips
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.state == TripState::Completed)
            .max_by_key(|t| t.end_time)
            .cloned())
    }

    async fn merge_into(&self, merged: &Trip, absorbed_id: &str) -> Result<()> {
        self.begin_write()?;
        let mut trips = self.trips.lock().unwrap();
        if !trips.iter().any(|t| t.id == merged.id) {
            bail!("merge target {} does not exist", merged.id);
        }
        trips.retain(|t| t.id != absorbed_id);
        for trip in trips.iter_mut().filter(|t| t.id == merged.id) {
            *trip = merged.clone();
        }
        for event in self.events.lock().unwrap().iter_mut() {
            if event.trip_id.as_deref() == Some(absorbed_id) {
                event.trip_id = Some(merged.id.clone());
            }
        }
        Ok(())
    }

    async fn get_unsynced_trips(&self, limit: usize) -> Result<Vec<Trip>> {
        let mut trips: Vec<Trip> = self
            .trips
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.state == TripState::Completed && !t.is_synced)
            .cloned()
            .collect();
        trips.truncate(limit);
        Ok(trips)
    }

    async fn mark_trip_synced(
        &self,
        id: &str,
        server_id: Option<String>,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        self.begin_write()?;
        let mut trips = self.trips.lock().unwrap();
        let trip = trips
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| anyhow!("trip {id} does not exist"))?;
        trip.is_synced = true;
        trip.synced_at = Some(synced_at);
        if server_id.is_some() {
            trip.server_id = server_id;
        }
        Ok(())
    }
}

#[async_trait]
impl MovementEventRepository for MemoryRepository {
    async fn insert_event(&self, event: &MovementEvent) -> Result<i64> {
        self.begin_write()?;
        let mut events = self.events.lock().unwrap();
        let id = events.len() as i64 + 1;
        let mut stored = event.clone();
        stored.id = Some(id);
        events.push(stored);
        Ok(id)
    }

    async fn get_events_for_trip(&self, trip_id: &str) -> Result<Vec<MovementEvent>> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.trip_id.as_deref() == Some(trip_id))
            .cloned()
            .collect())
    }

    async fn get_recent_events(&self, limit: usize) -> Result<Vec<MovementEvent>> {
        let mut events = self.events.lock().unwrap().clone();
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }

    async fn get_unsynced_events(&self, limit: usize) -> Result<Vec<MovementEvent>> {
        let mut events: Vec<MovementEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| !e.is_synced)
            .cloned()
            .collect();
        events.truncate(limit);
        Ok(events)
    }

    async fn mark_events_synced(&self, ids: &[i64], synced_at: DateTime<Utc>) -> Result<()> {
        self.begin_write()?;
        for event in self.events.lock().unwrap().iter_mut() {
            if event.id.map_or(false, |id| ids.contains(&id)) {
                event.is_synced = true;
                event.synced_at = Some(synced_at);
            }
        }
        Ok(())
    }
}
