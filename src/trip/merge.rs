use chrono::{DateTime, Duration, Utc};

use crate::models::{Trip, TripState};

/// Whether `next` starts close enough after `previous` ended to be folded into it.
pub fn should_merge(previous: &Trip, next: &Trip, max_gap: Duration) -> bool {
    if previous.id == next.id || previous.state != TripState::Completed {
        return false;
    }
    match previous.end_time {
        Some(previous_end) => {
            let gap = next.start_time - previous_end;
            gap >= Duration::zero() && gap <= max_gap
        }
        None => false,
    }
}

/// Coalesces a just-completed trip into the preceding one.
///
/// The result keeps `previous`'s id and start fields, takes the end fields from
/// `next`, concatenates segments and sums the accumulators. The gap between the
/// two trips belongs to no segment.
pub fn coalesce(previous: &Trip, next: &Trip, now: DateTime<Utc>) -> Trip {
    let mut merged = previous.clone();

    merged.segments.extend(next.segments.iter().cloned());
    merged.total_distance_meters += next.total_distance_meters;
    merged.location_count += next.location_count;
    for (mode, ms) in &next.mode_breakdown {
        *merged.mode_breakdown.entry(*mode).or_insert(0) += ms;
    }
    merged.modes_used.extend(next.modes_used.iter().copied());

    merged.start_location = previous.start_location.or(next.start_location);
    merged.end_time = next.end_time;
    merged.end_location = next.end_location.or(previous.end_location);
    merged.end_trigger = next.end_trigger;
    merged.state = TripState::Completed;
    merged.pending_since = None;

    // The sink has to re-upload the grown trip.
    merged.is_synced = false;
    merged.synced_at = None;
    merged.updated_at = now;

    merged.recompute_dominant();
    merged
}
