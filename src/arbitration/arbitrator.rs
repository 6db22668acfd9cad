use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{SourceId, TransportMode, TransportationState};

use super::config::ArbitrationConfig;

/// Merges the latest report from each detection source into one authoritative state.
pub struct ModeArbitrator {
    config: ArbitrationConfig,
    latest: HashMap<SourceId, TransportationState>,
    current: Option<TransportationState>,
}

/// Fresh votes for one mode.
#[derive(Debug, Clone, Copy)]
struct Agreement {
    best: Vote,
    latest: DateTime<Utc>,
    voters: usize,
}

#[derive(Debug, Clone, Copy)]
struct Vote {
    mode: TransportMode,
    confidence: f64,
    source: SourceId,
    rank: usize,
    timestamp: DateTime<Utc>,
}

impl ModeArbitrator {
    pub fn new(config: ArbitrationConfig) -> Self {
        Self {
            config,
            latest: HashMap::new(),
            current: None,
        }
    }

    pub fn config(&self) -> &ArbitrationConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: ArbitrationConfig) {
        self.config = config;
    }

    /// Last emitted merged state.
    pub fn current(&self) -> Option<TransportationState> {
        self.current
    }

    /// Records `report` as the latest from its source and returns the merged state
    /// if it differs from the previously emitted one.
    pub fn update(
        &mut self,
        report: TransportationState,
        now: DateTime<Utc>,
    ) -> Option<TransportationState> {
        if report.source.is_derived() {
            return None;
        }
        // Out-of-order delivery from the same source keeps the newer report.
        match self.latest.get(&report.source) {
            Some(existing) if existing.timestamp > report.timestamp => {}
            _ => {
                self.latest.insert(report.source, report);
            }
        }
        self.refresh(now)
    }

    /// Re-runs arbitration against `now`, letting stale sources drop out.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> Option<TransportationState> {
        let merged = self.merge(now);
        let changed = match &self.current {
            Some(previous) => {
                previous.mode != merged.mode
                    || previous.source != merged.source
                    || previous.confidence != merged.confidence
                    || previous.interval_multiplier != merged.interval_multiplier
            }
            None => true,
        };

        if changed {
            self.current = Some(merged);
            Some(merged)
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.latest.clear();
        self.current = None;
    }

    fn merge(&self, now: DateTime<Utc>) -> TransportationState {
        let votes: Vec<Vote> = self
            .latest
            .values()
            .filter(|report| now - report.timestamp <= self.config.staleness)
            .filter_map(|report| self.vote_for(report))
            .collect();

        // Group by mode: confidence is the max of agreeing sources, the representative
        // source is the strongest (then highest priority) among them.
        let mut groups: HashMap<TransportMode, Agreement> = HashMap::new();
        for vote in votes {
            groups
                .entry(vote.mode)
                .and_modify(|group| {
                    if beats(&vote, &group.best) {
                        group.best = vote;
                    }
                    group.latest = group.latest.max(vote.timestamp);
                    group.voters += 1;
                })
                .or_insert(Agreement {
                    best: vote,
                    latest: vote.timestamp,
                    voters: 1,
                });
        }

        let winner = groups
            .into_values()
            .fold(None, |acc: Option<Agreement>, candidate| match acc {
                Some(best) if !beats(&candidate.best, &best.best) => Some(best),
                _ => Some(candidate),
            });

        let Some(winner) = winner else {
            return TransportationState {
                interval_multiplier: self
                    .config
                    .interval_multiplier_for(TransportMode::Unknown),
                ..TransportationState::unknown(now)
            };
        };
        let mode = winner.best.mode;
        let source = if mode == TransportMode::InVehicle && winner.voters > 1 {
            SourceId::SensorFusion
        } else {
            winner.best.source
        };
        TransportationState {
            mode,
            confidence: winner.best.confidence,
            source,
            timestamp: winner.latest,
            interval_multiplier: self.config.interval_multiplier_for(mode),
        }
    }

    fn vote_for(&self, report: &TransportationState) -> Option<Vote> {
        if report.mode == TransportMode::Unknown || !report.confidence.is_finite() {
            return None;
        }
        if report.source.is_vehicle_specific()
            && (report.mode != TransportMode::InVehicle
                || report.confidence < self.config.vehicle_min_confidence)
        {
            return None;
        }
        Some(Vote {
            mode: report.mode,
            confidence: report.confidence,
            source: report.source,
            rank: self.config.rank(report.source),
            timestamp: report.timestamp,
        })
    }
}

/// Higher confidence wins; equal confidence goes to the better-ranked source.
fn beats(candidate: &Vote, incumbent: &Vote) -> bool {
    if candidate.confidence != incumbent.confidence {
        return candidate.confidence > incumbent.confidence;
    }
    if candidate.rank != incumbent.rank {
        return candidate.rank < incumbent.rank;
    }
    // Same source rank only happens for unlisted sources; fall back to mode order.
    candidate.mode < incumbent.mode
}
