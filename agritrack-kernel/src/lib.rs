//! AgriTrack kernel: telemetry ingestion, detection and alert dispatch for a
//! fleet of agricultural machines.

pub mod alerts;
pub mod clock;
pub mod config;
pub mod fuel;
pub mod geofence;
pub mod health;
pub mod http;
pub mod kernel;
pub mod models;
pub mod mqtt;
pub mod notify;
pub mod outbound;
pub mod registry;
pub mod snapshots;
pub mod store;
pub mod telemetry;
pub mod thresholds;
pub mod workers;

pub use kernel::{Kernel, KernelTasks};
