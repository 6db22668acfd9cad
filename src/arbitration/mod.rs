pub mod arbitrator;
pub mod config;

pub use arbitrator::ModeArbitrator;
pub use config::ArbitrationConfig;
