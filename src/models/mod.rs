pub mod mode;
pub mod movement_event;
pub mod trip;

pub use mode::{SourceId, TransportMode, TransportationState, DEFAULT_INTERVAL_MULTIPLIER};
pub use movement_event::{DeviceState, EventLocation, MovementEvent, NetworkType, SensorTelemetry};
pub use trip::{LatLng, Trip, TripModeSegment, TripState, TripTrigger};
