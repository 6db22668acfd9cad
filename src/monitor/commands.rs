use tokio::sync::oneshot;

use crate::{
    error::TripResult,
    models::{DeviceState, EventLocation, TransportationState, Trip},
    trip::StartOutcome,
};

/// Requests consumed in order by the monitor task.
pub(crate) enum MonitorCommand {
    Start {
        reply: oneshot::Sender<TripResult<Option<Trip>>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    ForceStart {
        reply: oneshot::Sender<TripResult<StartOutcome>>,
    },
    ForceEnd {
        reply: oneshot::Sender<TripResult<Option<Trip>>>,
    },
    Location {
        fix: EventLocation,
        reply: oneshot::Sender<TripResult<()>>,
    },
    AddDistance {
        trip_id: String,
        meters: f64,
        reply: oneshot::Sender<bool>,
    },
    Report(TransportationState),
    Sample {
        x: f64,
        y: f64,
        z: f64,
    },
    Device(DeviceState),
}

impl MonitorCommand {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            MonitorCommand::Start { .. } => "start",
            MonitorCommand::Stop { .. } => "stop",
            MonitorCommand::ForceStart { .. } => "force_start",
            MonitorCommand::ForceEnd { .. } => "force_end",
            MonitorCommand::Location { .. } => "location",
            MonitorCommand::AddDistance { .. } => "add_distance",
            MonitorCommand::Report(_) => "report",
            MonitorCommand::Sample { .. } => "sample",
            MonitorCommand::Device(_) => "device",
        }
    }
}
