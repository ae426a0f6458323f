/**
 * MACHINE STORE - Outbound persistence interface of the kernel
 *
 * ROLE :
 * Everything the kernel reads from or writes to the durable store goes
 * through the `MachineStore` trait: machine provisioning, telemetry batches,
 * alerts, geofence assignments, owner contacts and the fuel log.
 *
 * IMPLEMENTATIONS :
 * - `memory::InMemoryStore` : default backend, offline mode and tests
 * - `supabase::SupabaseStore` : PostgREST over HTTP
 *
 * CONTRACT :
 * Callers never let a `StoreError` abort a reading: every call site logs and
 * continues with in-memory state.
 */

pub mod memory;
pub mod supabase;

use crate::fuel::FuelSample;
use crate::geofence::Geofence;
use crate::models::{AlertRecord, OperationalState, SensorReading};
use crate::notify::OwnerContact;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub use memory::InMemoryStore;
pub use supabase::SupabaseStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Columns written when a machine is auto-provisioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineFields {
    pub name: String,
    pub status: OperationalState,
}

/// Row of the telemetry log (`sensor_logs`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub device_id: String,
    pub status: OperationalState,
    pub temperature: f64,
    pub vibration_x: f64,
    pub vibration_y: f64,
    pub vibration_z: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed: Option<f64>,
    pub fuel_level: Option<f64>,
    pub engine_hours: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl TelemetryRecord {
    pub fn from_reading(reading: &SensorReading, status: OperationalState) -> Self {
        Self {
            device_id: reading.machine_id.clone(),
            status,
            temperature: reading.temperature,
            vibration_x: reading.vibration.x,
            vibration_y: reading.vibration.y,
            vibration_z: reading.vibration.z,
            latitude: reading.position.map(|p| p.lat),
            longitude: reading.position.map(|p| p.lng),
            speed: reading.speed,
            fuel_level: reading.fuel_level,
            engine_hours: reading.engine_hours,
            timestamp: reading.timestamp,
        }
    }
}

#[async_trait]
pub trait MachineStore: Send + Sync {
    /// Idempotent insert-or-update keyed by device id. Returns the row id.
    async fn upsert_machine(
        &self,
        device_id: &str,
        fields: &MachineFields,
    ) -> Result<String, StoreError>;

    async fn find_machine(&self, device_id: &str) -> Result<Option<String>, StoreError>;

    async fn batch_insert_telemetry(
        &self,
        records: &[TelemetryRecord],
    ) -> Result<usize, StoreError>;

    /// Returns the stored record with its id filled in.
    async fn insert_alert(&self, alert: &AlertRecord) -> Result<AlertRecord, StoreError>;

    /// `(device id, geofence)` pairs, one per assignment.
    async fn load_geofence_assignments(&self) -> Result<Vec<(String, Geofence)>, StoreError>;

    async fn owner_contact(&self, device_id: &str) -> Result<Option<OwnerContact>, StoreError>;

    /// Fuel samples since `since`, oldest first.
    async fn fuel_history(
        &self,
        device_id: &str,
        since: OffsetDateTime,
    ) -> Result<Vec<FuelSample>, StoreError>;
}
