pub mod arbitration;
pub mod db;
pub mod error;
pub mod models;
pub mod monitor;
pub mod replay;
pub mod repository;
pub mod settings;
pub mod telemetry;
pub mod trip;
mod utils;

use std::{env, path::PathBuf};

use anyhow::Context;

pub use arbitration::{ArbitrationConfig, ModeArbitrator};
pub use db::Database;
pub use error::{TripError, TripResult};
pub use models::{
    DeviceState, LatLng, MovementEvent, SourceId, TransportMode, TransportationState, Trip,
    TripModeSegment, TripState, TripTrigger,
};
pub use monitor::TripMonitor;
pub use repository::{MovementEventRepository, TripRepository};
pub use settings::{SettingsStore, TripSettings};
pub use telemetry::TelemetryBuffer;
pub use trip::{StartOutcome, TripStateMachine};

const DEFAULT_DB_FILE: &str = "tripwise.sqlite3";
const DEFAULT_SETTINGS_FILE: &str = "tripwise-settings.json";

/// Replays JSON-lines detections from stdin against the on-disk store and prints
/// the most recent trips when the input ends.
pub fn run() -> anyhow::Result<()> {
    let debug_mode = env::var("TRIPWISE_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    // RUST_LOG still wins over the default level.
    env_logger::Builder::new()
        .filter_level(if debug_mode {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();

    log::info!("tripwise starting up...");

    let db_path = env::var_os("TRIPWISE_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILE));
    let settings_path = env::var_os("TRIPWISE_SETTINGS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async move {
        let database = Database::new(db_path.clone())
            .with_context(|| format!("failed to open database at {}", db_path.display()))?;
        let settings = SettingsStore::new(settings_path)?;

        let monitor = TripMonitor::with_database(database, settings.subscribe());
        if let Some(trip) = monitor.start_monitoring().await? {
            log::warn!(
                "Recovered {} trip {} from a previous run",
                trip.state.as_str(),
                trip.id
            );
        }

        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        let result = replay::replay(&monitor, stdin, &mut stdout).await;

        monitor.stop_monitoring().await?;
        monitor.shutdown().await;
        result?;
        Ok::<(), anyhow::Error>(())
    })
}
