use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::machine::{StartOutcome, TripStateMachine};
use super::test_support::MemoryRepository;
use crate::error::TripError;
use crate::models::{TransportMode, Trip, TripState, TripTrigger};
use crate::repository::TripRepository;
use crate::settings::TripSettings;

use TransportMode::{Cycling, InVehicle, Running, Stationary, Unknown, Walking};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

fn machine_with(settings: TripSettings) -> (TripStateMachine, Arc<MemoryRepository>) {
    let repo = Arc::new(MemoryRepository::new());
    let machine = TripStateMachine::new(repo.clone(), settings);
    (machine, repo)
}

fn machine() -> (TripStateMachine, Arc<MemoryRepository>) {
    machine_with(TripSettings::default())
}

fn assert_accounting(trip: &Trip) {
    assert_eq!(
        trip.mode_breakdown.values().sum::<u64>(),
        trip.closed_segments_ms(),
        "breakdown must equal closed segment time for {}",
        trip.id
    );
}

#[tokio::test]
async fn test_short_stop_merges_back_into_trip() {
    let (mut machine, repo) = machine();

    machine.on_mode_change(Walking, at(0)).await.unwrap();
    machine.on_mode_change(Stationary, at(30)).await.unwrap();
    assert_eq!(machine.state(), TripState::PendingEnd);
    machine.on_mode_change(Walking, at(40)).await.unwrap();

    assert_eq!(machine.state(), TripState::Active);
    let trip = machine.active_trip().unwrap();
    assert_eq!(trip.start_time, at(0));
    assert_eq!(trip.end_time, None);
    assert_eq!(trip.segments.len(), 1);

    let breakdown = trip.breakdown_at(at(40));
    assert_eq!(breakdown.len(), 1);
    assert_eq!(breakdown.get(&Walking), Some(&40_000));
    assert_eq!(repo.all_trips().len(), 1);
}

#[tokio::test]
async fn test_vehicle_grace_period_sets_end_time() {
    let (mut machine, repo) = machine();

    machine.on_mode_change(InVehicle, at(0)).await.unwrap();
    machine.on_mode_change(Stationary, at(200)).await.unwrap();
    assert_eq!(machine.next_deadline(), Some(at(290)));

    assert!(machine.on_deadline(at(289)).await.unwrap().is_none());
    let completed = machine.on_deadline(at(290)).await.unwrap().unwrap();

    assert_eq!(completed.state, TripState::Completed);
    assert_eq!(completed.end_time, Some(at(290)));
    assert_eq!(completed.end_trigger, Some(TripTrigger::Time));
    assert_eq!(completed.dominant_mode, InVehicle);
    assert_eq!(completed.mode_breakdown.get(&InVehicle), Some(&290_000));
    assert_accounting(&completed);

    assert_eq!(machine.state(), TripState::Idle);
    assert!(machine.active_trip().is_none());
    assert_eq!(repo.all_trips(), vec![completed]);
}

#[tokio::test]
async fn test_stop_shorter_than_vehicle_grace_keeps_one_trip() {
    let (mut machine, repo) = machine();

    machine.on_mode_change(InVehicle, at(0)).await.unwrap();
    machine.on_mode_change(Stationary, at(100)).await.unwrap();
    assert!(machine.on_deadline(at(150)).await.unwrap().is_none());
    machine.on_mode_change(InVehicle, at(180)).await.unwrap();

    assert_eq!(repo.all_trips().len(), 1);
    assert_eq!(machine.state(), TripState::Active);
    assert_eq!(machine.next_deadline(), None);
}

async fn run_two_trips(settings: TripSettings) -> Vec<Trip> {
    let (mut machine, repo) = machine_with(settings);

    machine.on_mode_change(Walking, at(0)).await.unwrap();
    machine.on_mode_change(Stationary, at(600)).await.unwrap();
    let first = machine.on_deadline(at(660)).await.unwrap().unwrap();
    assert_eq!(first.end_time, Some(at(660)));

    machine.on_mode_change(Walking, at(680)).await.unwrap();
    machine.on_mode_change(Stationary, at(800)).await.unwrap();
    machine.on_deadline(at(860)).await.unwrap().unwrap();

    assert_eq!(repo.open_count(), 0);
    repo.all_trips()
}

#[tokio::test]
async fn test_auto_merge_coalesces_adjacent_trips() {
    let settings = TripSettings {
        auto_merge_enabled: true,
        auto_merge_gap_secs: 30,
        ..TripSettings::default()
    };
    let trips = run_two_trips(settings).await;

    assert_eq!(trips.len(), 1);
    let merged = &trips[0];
    assert_eq!(merged.start_time, at(0));
    assert_eq!(merged.end_time, Some(at(860)));
    assert_eq!(merged.segments.len(), 2);
    assert_eq!(merged.mode_breakdown.get(&Walking), Some(&840_000));
    assert_accounting(merged);
}

#[tokio::test]
async fn test_auto_merge_disabled_keeps_two_trips() {
    let settings = TripSettings {
        auto_merge_enabled: false,
        auto_merge_gap_secs: 30,
        ..TripSettings::default()
    };
    let trips = run_two_trips(settings).await;

    assert_eq!(trips.len(), 2);
    assert!(trips.iter().all(|trip| trip.state == TripState::Completed));
}

#[tokio::test]
async fn test_gap_wider_than_merge_window_keeps_two_trips() {
    let settings = TripSettings {
        auto_merge_enabled: true,
        auto_merge_gap_secs: 10,
        ..TripSettings::default()
    };
    assert_eq!(run_two_trips(settings).await.len(), 2);
}

#[tokio::test]
async fn test_deleted_merge_target_completes_trip_alone() {
    let (mut machine, repo) = machine_with(TripSettings {
        auto_merge_enabled: true,
        auto_merge_gap_secs: 30,
        ..TripSettings::default()
    });

    machine.on_mode_change(Walking, at(0)).await.unwrap();
    machine.on_mode_change(Stationary, at(600)).await.unwrap();
    let first = machine.on_deadline(at(660)).await.unwrap().unwrap();
    repo.delete_trip(&first.id);

    machine.on_mode_change(Walking, at(680)).await.unwrap();
    machine.on_mode_change(Stationary, at(800)).await.unwrap();
    let second = machine.on_deadline(at(860)).await.unwrap().unwrap();

    assert_ne!(second.id, first.id);
    assert_eq!(second.start_time, at(680));
    assert_eq!(second.state, TripState::Completed);
    assert_eq!(machine.state(), TripState::Idle);
    assert_eq!(repo.all_trips(), vec![second]);
}

#[tokio::test]
async fn test_huge_grace_does_not_overflow_deadline() {
    let (mut machine, _repo) = machine_with(TripSettings {
        vehicle_grace_secs: 10_000_000_000_000,
        finalize_retry_secs: u64::MAX,
        ..TripSettings::default()
    });

    machine.on_mode_change(InVehicle, at(0)).await.unwrap();
    machine.on_mode_change(Stationary, at(10)).await.unwrap();

    let deadline = machine.next_deadline().unwrap();
    assert_eq!(deadline, at(10) + Duration::days(1));
    assert_eq!(machine.on_deadline(at(3_600)).await.unwrap(), None);
    let completed = machine.on_deadline(deadline).await.unwrap().unwrap();
    assert_eq!(completed.end_time, Some(deadline));
}

#[tokio::test]
async fn test_overdue_grace_finalizes_before_new_trip() {
    let (mut machine, repo) = machine_with(TripSettings {
        auto_merge_enabled: false,
        ..TripSettings::default()
    });

    machine.on_mode_change(Walking, at(0)).await.unwrap();
    machine.on_mode_change(Stationary, at(10)).await.unwrap();
    // No deadline tick was delivered; movement arrives well after the grace period.
    let completed = machine.on_mode_change(Cycling, at(200)).await.unwrap().unwrap();

    assert_eq!(completed.end_time, Some(at(70)));
    let active = machine.active_trip().unwrap();
    assert_ne!(active.id, completed.id);
    assert_eq!(active.start_time, at(200));
    assert_eq!(repo.all_trips().len(), 2);
    assert_eq!(repo.open_count(), 1);
}

#[tokio::test]
async fn test_mode_switch_closes_segment() {
    let (mut machine, _repo) = machine();

    machine.on_mode_change(Walking, at(0)).await.unwrap();
    machine.on_mode_change(Running, at(60)).await.unwrap();
    machine.on_mode_change(Running, at(70)).await.unwrap();
    machine.on_mode_change(InVehicle, at(300)).await.unwrap();

    let trip = machine.active_trip().unwrap();
    assert_eq!(trip.segments.len(), 3);
    assert_eq!(trip.mode_breakdown.get(&Walking), Some(&60_000));
    assert_eq!(trip.mode_breakdown.get(&Running), Some(&240_000));
    assert_eq!(trip.dominant_mode, Running);
    assert_eq!(trip.modes_used.len(), 3);
    assert_accounting(trip);
}

#[tokio::test]
async fn test_resume_with_new_mode_attributes_gap_to_exited_mode() {
    let (mut machine, _repo) = machine();

    machine.on_mode_change(Walking, at(0)).await.unwrap();
    machine.on_mode_change(Stationary, at(30)).await.unwrap();
    machine.on_mode_change(InVehicle, at(50)).await.unwrap();

    let trip = machine.active_trip().unwrap();
    assert_eq!(trip.mode_breakdown.get(&Walking), Some(&50_000));
    assert_eq!(trip.current_mode(), Some(InVehicle));
    assert_eq!(trip.pending_since, None);
}

#[tokio::test]
async fn test_unknown_while_active_starts_grace_period() {
    let (mut machine, _repo) = machine();

    machine.on_mode_change(Cycling, at(0)).await.unwrap();
    machine.on_mode_change(Unknown, at(40)).await.unwrap();

    assert_eq!(machine.state(), TripState::PendingEnd);
    assert_eq!(machine.next_deadline(), Some(at(100)));
}

#[tokio::test]
async fn test_stationary_while_idle_does_nothing() {
    let (mut machine, repo) = machine();

    machine.on_mode_change(Stationary, at(0)).await.unwrap();
    machine.on_mode_change(Unknown, at(10)).await.unwrap();

    assert_eq!(machine.state(), TripState::Idle);
    assert_eq!(repo.write_count(), 0);
}

#[tokio::test]
async fn test_force_end_without_trip_writes_nothing() {
    let (mut machine, repo) = machine();

    assert!(machine.force_end(at(0)).await.unwrap().is_none());
    assert!(machine.force_end(at(5)).await.unwrap().is_none());
    assert_eq!(repo.write_count(), 0);
}

#[tokio::test]
async fn test_force_start_is_idempotent() {
    let (mut machine, repo) = machine();

    let first = machine.force_start(at(0)).await.unwrap();
    let StartOutcome::Started(started) = &first else {
        panic!("expected a new trip, got {first:?}");
    };
    assert_eq!(started.start_trigger, TripTrigger::Manual);

    let second = machine.force_start(at(10)).await.unwrap();
    assert!(matches!(second, StartOutcome::AlreadyActive(_)));
    assert_eq!(second.trip().id, started.id);
    assert_eq!(repo.all_trips().len(), 1);
}

#[tokio::test]
async fn test_force_end_finalizes_with_manual_trigger() {
    let (mut machine, _repo) = machine();

    machine.on_mode_change(Walking, at(0)).await.unwrap();
    let ended = machine.force_end(at(45)).await.unwrap().unwrap();

    assert_eq!(ended.end_trigger, Some(TripTrigger::Manual));
    assert_eq!(ended.end_time, Some(at(45)));
    assert_eq!(ended.end_location, None, "no fix ever arrived");
    assert_eq!(ended.mode_breakdown.get(&Walking), Some(&45_000));
    assert_eq!(machine.state(), TripState::Idle);
}

#[tokio::test]
async fn test_below_minimum_trip_is_still_persisted() {
    let (mut machine, repo) = machine();

    machine.on_mode_change(Walking, at(0)).await.unwrap();
    machine.on_mode_change(Stationary, at(5)).await.unwrap();
    let completed = machine.on_deadline(at(65)).await.unwrap().unwrap();

    assert!(completed.is_below_minimum(120_000, 100.0));
    assert_eq!(repo.all_trips()[0].state, TripState::Completed);
}

#[tokio::test]
async fn test_recovery_adopts_active_trip() {
    let stored = Trip::start(Walking, TripTrigger::ModeChange, at(0), None);
    let repo = Arc::new(MemoryRepository::with_trips(vec![stored.clone()]));
    let mut machine = TripStateMachine::new(repo.clone(), TripSettings::default());

    let adopted = machine.recover(at(120)).await.unwrap().unwrap();
    assert_eq!(adopted.id, stored.id);
    assert_eq!(machine.state(), TripState::Active);

    machine.on_mode_change(Walking, at(130)).await.unwrap();
    assert_eq!(machine.active_trip().unwrap().id, stored.id);
    assert_eq!(repo.all_trips().len(), 1);
}

#[tokio::test]
async fn test_recovery_of_expired_pending_trip_finalizes_at_deadline() {
    let mut stored = Trip::start(InVehicle, TripTrigger::ModeChange, at(0), None);
    stored.state = TripState::PendingEnd;
    stored.pending_since = Some(at(600));
    let repo = Arc::new(MemoryRepository::with_trips(vec![stored.clone()]));
    let mut machine = TripStateMachine::new(repo.clone(), TripSettings::default());

    machine.recover(at(3600)).await.unwrap();
    assert_eq!(machine.next_deadline(), Some(at(690)));

    let completed = machine.on_deadline(at(3600)).await.unwrap().unwrap();
    assert_eq!(completed.id, stored.id);
    assert_eq!(completed.end_time, Some(at(690)));
    assert_accounting(&completed);
    assert_eq!(machine.state(), TripState::Idle);
    assert_eq!(repo.open_count(), 0);
}

#[tokio::test]
async fn test_force_end_adopts_stored_trip() {
    let stored = Trip::start(Cycling, TripTrigger::ModeChange, at(0), None);
    let repo = Arc::new(MemoryRepository::with_trips(vec![stored.clone()]));
    let mut machine = TripStateMachine::new(repo.clone(), TripSettings::default());

    let ended = machine.force_end(at(300)).await.unwrap().unwrap();

    assert_eq!(ended.id, stored.id);
    assert_eq!(ended.end_time, Some(at(300)));
    assert_eq!(ended.end_trigger, Some(TripTrigger::Manual));
    assert_eq!(machine.state(), TripState::Idle);
    assert_eq!(repo.open_count(), 0);
}

#[tokio::test]
async fn test_recovery_reopens_missing_segment() {
    let mut stored = Trip::start(Cycling, TripTrigger::ModeChange, at(0), None);
    stored.close_open_segment(at(100));
    stored.updated_at = at(150);
    let repo = Arc::new(MemoryRepository::with_trips(vec![stored]));
    let mut machine = TripStateMachine::new(repo, TripSettings::default());

    let adopted = machine.recover(at(200)).await.unwrap().unwrap();
    let open = adopted.open_segment_ref().unwrap();
    assert_eq!(open.mode, Cycling);
    assert_eq!(open.start_time, at(150));
    assert_eq!(machine.current_mode(), Cycling);
}

#[tokio::test]
async fn test_start_adopts_trip_created_elsewhere() {
    let stored = Trip::start(Running, TripTrigger::Manual, at(0), None);
    let repo = Arc::new(MemoryRepository::with_trips(vec![stored.clone()]));
    let mut machine = TripStateMachine::new(repo.clone(), TripSettings::default());

    let outcome = machine.force_start(at(10)).await.unwrap();
    assert!(matches!(outcome, StartOutcome::AlreadyActive(_)));
    assert_eq!(outcome.trip().id, stored.id);
    assert_eq!(repo.all_trips().len(), 1);
}

#[tokio::test]
async fn test_failed_finalize_stays_pending_and_retries() {
    let (mut machine, repo) = machine();

    machine.on_mode_change(Walking, at(0)).await.unwrap();
    machine.on_mode_change(Stationary, at(100)).await.unwrap();

    repo.set_fail_writes(true);
    let err = machine.on_deadline(at(160)).await.unwrap_err();
    assert!(matches!(err, TripError::Repository(_)));
    assert_eq!(machine.state(), TripState::PendingEnd);
    assert!(machine.active_trip().is_some());
    assert_eq!(machine.next_deadline(), Some(at(190)));

    repo.set_fail_writes(false);
    assert!(machine.on_deadline(at(180)).await.unwrap().is_none());
    let completed = machine.on_deadline(at(190)).await.unwrap().unwrap();
    assert_eq!(completed.end_time, Some(at(160)));
    assert_eq!(repo.all_trips()[0].state, TripState::Completed);
}

#[tokio::test]
async fn test_failed_force_end_surfaces_error() {
    let (mut machine, repo) = machine();

    machine.on_mode_change(Cycling, at(0)).await.unwrap();
    repo.set_fail_writes(true);

    assert!(machine.force_end(at(30)).await.is_err());
    assert_eq!(machine.state(), TripState::PendingEnd);

    repo.set_fail_writes(false);
    let completed = machine.on_deadline(at(60)).await.unwrap().unwrap();
    assert_eq!(completed.end_trigger, Some(TripTrigger::Manual));
    assert_eq!(completed.end_time, Some(at(30)));
}

#[tokio::test]
async fn test_failed_start_is_retried() {
    let (mut machine, repo) = machine();

    repo.set_fail_writes(true);
    assert!(machine.on_mode_change(Walking, at(0)).await.is_err());
    assert_eq!(machine.state(), TripState::Idle);
    assert_eq!(machine.next_deadline(), Some(at(30)));

    repo.set_fail_writes(false);
    machine.on_deadline(at(30)).await.unwrap();
    assert_eq!(machine.state(), TripState::Active);
    assert_eq!(machine.active_trip().unwrap().start_time, at(30));
}

#[tokio::test]
async fn test_incremental_write_failure_does_not_block_tracking() {
    let (mut machine, repo) = machine();

    machine.on_mode_change(Walking, at(0)).await.unwrap();
    repo.set_fail_writes(true);
    machine.on_mode_change(Cycling, at(20)).await.unwrap();
    machine.on_location(51.5, -0.12, at(21)).await.unwrap();

    assert_eq!(machine.active_trip().unwrap().current_mode(), Some(Cycling));
}

#[tokio::test]
async fn test_locations_accumulate_distance() {
    let (mut machine, repo) = machine();

    machine.on_mode_change(Walking, at(0)).await.unwrap();
    machine.on_location(0.0, 0.0, at(1)).await.unwrap();
    machine.on_location(0.001, 0.0, at(10)).await.unwrap();
    machine.on_location(0.002, 0.0, at(20)).await.unwrap();

    let trip = machine.active_trip().unwrap();
    assert_eq!(trip.location_count, 3);
    assert!((trip.total_distance_meters - 222.39).abs() < 0.1, "{}", trip.total_distance_meters);
    assert_eq!(trip.start_location.map(|l| l.latitude), Some(0.0));

    let stored = repo.get_trip_by_id(&trip.id).await.unwrap().unwrap();
    assert_eq!(stored.location_count, 3);
    assert!((stored.total_distance_meters - trip.total_distance_meters).abs() < 1e-6);
}

#[tokio::test]
async fn test_invalid_location_is_rejected() {
    let (mut machine, _repo) = machine();
    machine.on_mode_change(Walking, at(0)).await.unwrap();

    let err = machine.on_location(123.0, 0.0, at(1)).await.unwrap_err();
    assert!(matches!(err, TripError::InvalidLocation { .. }));
    assert_eq!(machine.active_trip().unwrap().location_count, 0);
}

#[tokio::test]
async fn test_add_distance_targets_open_trip_only() {
    let (mut machine, repo) = machine();
    machine.on_mode_change(Cycling, at(0)).await.unwrap();
    let id = machine.active_trip().unwrap().id.clone();

    assert!(machine.add_distance(&id, 250.0, at(5)).await);
    assert!(!machine.add_distance(&id, -10.0, at(6)).await);
    assert!(!machine.add_distance("other", 10.0, at(7)).await);
    assert!(!machine.add_distance(&id, f64::NAN, at(8)).await);

    let trip = machine.active_trip().unwrap();
    assert_eq!(trip.total_distance_meters, 250.0);
    assert_eq!(trip.location_count, 1);
    let stored = repo.get_trip_by_id(&id).await.unwrap().unwrap();
    assert_eq!(stored.total_distance_meters, 250.0);
    assert_eq!(stored.location_count, 1);
}

#[tokio::test]
async fn test_distance_trigger_starts_trip() {
    let (mut machine, _repo) = machine_with(TripSettings {
        distance_start_meters: Some(100.0),
        ..TripSettings::default()
    });

    machine.on_location(0.0, 0.0, at(0)).await.unwrap();
    machine.on_location(0.0005, 0.0, at(30)).await.unwrap();
    assert_eq!(machine.state(), TripState::Idle);

    machine.on_location(0.001, 0.0, at(60)).await.unwrap();
    let trip = machine.active_trip().unwrap();
    assert_eq!(trip.start_trigger, TripTrigger::Distance);
    assert_eq!(trip.start_location.map(|l| l.latitude), Some(0.0));
    assert!(trip.total_distance_meters > 100.0);
}

#[tokio::test]
async fn test_random_sequences_keep_single_active_trip() {
    let modes = [Stationary, Walking, Running, Cycling, InVehicle, Unknown];

    for seed in 0..20u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let (mut machine, repo) = machine_with(TripSettings {
            auto_merge_gap_secs: rng.gen_range(0..120),
            ..TripSettings::default()
        });
        let mut clock = 0i64;
        let mut last_distance: Option<(String, f64)> = None;

        for _ in 0..300 {
            clock += rng.gen_range(0..90);
            let now = at(clock);
            match rng.gen_range(0..10) {
                0..=4 => {
                    let mode = modes[rng.gen_range(0..modes.len())];
                    machine.on_mode_change(mode, now).await.unwrap();
                }
                5 | 6 => {
                    let lat = rng.gen_range(-0.01..0.01);
                    let lon = rng.gen_range(-0.01..0.01);
                    machine.on_location(lat, lon, now).await.unwrap();
                }
                7 => {
                    machine.force_start(now).await.unwrap();
                }
                8 => {
                    machine.force_end(now).await.unwrap();
                }
                _ => {
                    machine.on_deadline(now).await.unwrap();
                }
            }

            assert!(repo.open_count() <= 1, "seed {seed}: more than one open trip");
            assert_eq!(machine.active_trip().is_some(), machine.state().is_open());

            if let Some(trip) = machine.active_trip() {
                if let Some((id, distance)) = &last_distance {
                    if *id == trip.id {
                        assert!(trip.total_distance_meters >= *distance, "seed {seed}: distance decreased");
                    }
                }
                last_distance = Some((trip.id.clone(), trip.total_distance_meters));
            }
        }

        for trip in repo.all_trips() {
            if trip.state == TripState::Completed {
                assert_accounting(&trip);
                assert!(trip.segments.iter().all(|segment| !segment.is_open()));
            }
        }
    }
}
