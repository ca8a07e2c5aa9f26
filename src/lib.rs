//! Health ML - online modeling for personal health metrics
//!
//! Consumes health measurements (weight, sleep, heart rate, recovery,
//! calories, HRV, blood pressure) arriving as JSON messages and publishes
//! derived signals back onto the channel:
//!
//! - **Anomaly mode**: an isolation forest retrained on a bounded window flags
//!   the newest reading.
//! - **Forecast modes**: a linear regressor retrained on the rolling history
//!   projects weight 30 days ahead with a confidence and risk class.
//!
//! Every cycle is a cold fit; no model state survives between messages.

pub mod anomaly;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod forecast;
pub mod history;
#[cfg(feature = "mqtt")]
pub mod mqtt;
pub mod publisher;
pub mod types;

pub use config::{EngineConfig, EngineMode, Options};
pub use engine::{CycleOutcome, Engine};
pub use error::EngineError;
pub use publisher::ResultPublisher;

/// Engine version reported by the CLI
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name used in logs and client identifiers
pub const PRODUCER_NAME: &str = "health-ml";
