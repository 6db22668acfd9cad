//! Storage seams consumed by the trip engine.
//!
//! The SQLite implementation lives in `crate::db`; tests substitute their own.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::models::{MovementEvent, Trip};

#[async_trait]
pub trait TripRepository: Send + Sync {
    /// The trip in ACTIVE or PENDING_END, if any.
    async fn get_active_trip(&self) -> Result<Option<Trip>>;

    async fn insert(&self, trip: &Trip) -> Result<String>;

    /// Full overwrite of the row and its segments.
    async fn update(&self, trip: &Trip) -> Result<()>;

    async fn get_trip_by_id(&self, id: &str) -> Result<Option<Trip>>;

    /// Trips whose start time falls in `[from, to]`, oldest first.
    async fn get_trips_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Trip>>;

    /// Most recent trips by start time, newest first.
    async fn get_recent_trips(&self, limit: usize) -> Result<Vec<Trip>>;

    /// Feed that re-emits the recent trips after every trip write.
    async fn observe_recent_trips(&self, limit: usize) -> Result<watch::Receiver<Vec<Trip>>>;

    /// Adds one location fix and its distance delta to the stored trip. Externally
    /// measured distance goes through here too and counts as a fix.
    async fn increment_location_count(
        &self,
        id: &str,
        distance_delta: f64,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_last_completed_trip(&self) -> Result<Option<Trip>>;

    /// Atomically stores `merged` and folds `absorbed_id` into it: the absorbed
    /// row is removed and its movement events re-pointed at `merged`.
    async fn merge_into(&self, merged: &Trip, absorbed_id: &str) -> Result<()>;

    async fn get_unsynced_trips(&self, limit: usize) -> Result<Vec<Trip>>;

    async fn mark_trip_synced(
        &self,
        id: &str,
        server_id: Option<String>,
        synced_at: DateTime<Utc>,
    ) -> Result<()>;
}

#[async_trait]
pub trait MovementEventRepository: Send + Sync {
    async fn insert_event(&self, event: &MovementEvent) -> Result<i64>;

    async fn get_events_for_trip(&self, trip_id: &str) -> Result<Vec<MovementEvent>>;

    async fn get_recent_events(&self, limit: usize) -> Result<Vec<MovementEvent>>;

    async fn get_unsynced_events(&self, limit: usize) -> Result<Vec<MovementEvent>>;

    async fn mark_events_synced(&self, ids: &[i64], synced_at: DateTime<Utc>) -> Result<()>;
}
