/**
 * TELEMETRY INGESTOR - Per-reading pipeline
 *
 * ROLE :
 * Validates raw sensor payloads, derives the operational state, queues
 * provisioning of unknown machines, runs the detectors and routes the
 * merged alerts to the dispatcher. Also feeds the snapshot store, the
 * telemetry batcher and the live hub. Never awaits the store.
 *
 * PAYLOAD :
 * {"id": "sim_001", "temp": 72.4, "vib_x": 0.12, "vib_y": 0.05, "vib_z": 0.02,
 *  "gps": [30.90, 75.85], "speed": 8.5, "fuel_level": 64.0,
 *  "engine_hours": 1203.5, "timestamp": 1718000000000, "mode": "active"}
 * `mode` is ignored, the state is always derived.
 *
 * ORDERING :
 * `process` must not run concurrently for the same machine; the worker pool
 * guarantees it by routing each machine to a single shard.
 */

use crate::alerts::{AlertDispatcher, ExternalAlert};
use crate::clock::Clock;
use crate::config::ThresholdConf;
use crate::fuel::FuelAnalyticsEngine;
use crate::geofence::GeofenceEngine;
use crate::health::HealthTracker;
use crate::models::{
    CandidateAlert, GeoPoint, MachineSnapshot, OperationalState, SensorReading, Vibration,
};
use crate::outbound::{Job, OutboundQueue, TelemetryBatcher};
use crate::registry::{Lookup, MachineRegistry, ProvisionJob};
use crate::snapshots::{MachineStateStore, SnapshotHub};
use crate::store::{MachineFields, MachineStore, TelemetryRecord};
use crate::thresholds::ThresholdDetector;
use serde::Deserialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ReadingError {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Empty machine id")]
    EmptyId,
    #[error("Field {0} is not a finite number")]
    NonFinite(&'static str),
}

#[derive(Debug, Deserialize)]
struct RawReading {
    id: String,
    temp: f64,
    vib_x: f64,
    vib_y: f64,
    vib_z: f64,
    #[serde(default)]
    gps: Option<Vec<f64>>,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    fuel_level: Option<f64>,
    #[serde(default)]
    engine_hours: Option<f64>,
    /// epoch milliseconds
    #[serde(default)]
    timestamp: Option<f64>,
}

fn finite(value: f64, field: &'static str) -> Result<f64, ReadingError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ReadingError::NonFinite(field))
    }
}

fn optional(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// None for timestamps outside the representable range.
fn epoch_ms(ms: f64) -> Option<OffsetDateTime> {
    let nanos = ms * 1_000_000.0;
    if !nanos.is_finite() || nanos.abs() >= i128::MAX as f64 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp_nanos(nanos as i128).ok()
}

impl SensorReading {
    /// Parses and normalizes a raw payload. `received_at` is used when the
    /// payload carries no usable timestamp.
    pub fn from_payload(
        payload: &[u8],
        received_at: OffsetDateTime,
    ) -> Result<Self, ReadingError> {
        let raw: RawReading = serde_json::from_slice(payload)?;
        let machine_id = raw.id.trim().to_string();
        if machine_id.is_empty() {
            return Err(ReadingError::EmptyId);
        }

        let position = match raw.gps.as_deref() {
            Some([lat, lng]) => Some(GeoPoint::new(*lat, *lng)),
            Some(other) => {
                debug!(
                    machine_id = %machine_id,
                    len = other.len(),
                    "gps ignored, expected [lat, lng]"
                );
                None
            }
            None => None,
        };

        let fuel_level = match optional(raw.fuel_level) {
            Some(level) if !(0.0..=100.0).contains(&level) => {
                warn!(machine_id = %machine_id, level, "fuel level out of range, ignored");
                None
            }
            level => level,
        };

        Ok(Self {
            temperature: finite(raw.temp, "temp")?,
            vibration: Vibration::new(
                finite(raw.vib_x, "vib_x")?,
                finite(raw.vib_y, "vib_y")?,
                finite(raw.vib_z, "vib_z")?,
            ),
            position,
            speed: optional(raw.speed),
            fuel_level,
            engine_hours: optional(raw.engine_hours),
            timestamp: raw.timestamp.and_then(epoch_ms).unwrap_or(received_at),
            machine_id,
        })
    }
}

/// off when the accelerometer reads nothing, idle when vibrating below the
/// idle speed, active otherwise.
pub fn derive_state(
    vibration: &Vibration,
    speed: Option<f64>,
    idle_speed: f64,
) -> OperationalState {
    if vibration.magnitude() == 0.0 {
        return OperationalState::Off;
    }
    match speed {
        Some(s) if s < idle_speed => OperationalState::Idle,
        _ => OperationalState::Active,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub machine_id: String,
    pub state: OperationalState,
    pub candidates: Vec<CandidateAlert>,
    pub accepted: Vec<CandidateAlert>,
}

/// Shared components the ingestor writes to.
#[derive(Clone)]
pub struct IngestorDeps {
    pub store: Arc<dyn MachineStore>,
    pub clock: Arc<dyn Clock>,
    pub health: HealthTracker,
    pub geofences: Arc<GeofenceEngine>,
    pub fuel: Arc<FuelAnalyticsEngine>,
    pub dispatcher: Arc<AlertDispatcher>,
    pub snapshots: Arc<MachineStateStore>,
    pub hub: Arc<SnapshotHub>,
    pub batcher: Arc<TelemetryBatcher>,
    pub queue: Arc<OutboundQueue>,
    pub registry: Arc<MachineRegistry>,
}

pub struct TelemetryIngestor {
    thresholds: ThresholdDetector,
    idle_speed: f64,
    deps: IngestorDeps,
}

impl TelemetryIngestor {
    pub fn new(conf: &ThresholdConf, deps: IngestorDeps) -> Self {
        Self {
            thresholds: ThresholdDetector::new(conf),
            idle_speed: conf.idle_speed,
            deps,
        }
    }

    pub fn process_payload(&self, payload: &[u8]) -> Result<ProcessOutcome, ReadingError> {
        match SensorReading::from_payload(payload, self.deps.clock.now()) {
            Ok(reading) => Ok(self.process(reading)),
            Err(e) => {
                self.deps.health.reading_rejected();
                warn!("reading rejected: {e}");
                Err(e)
            }
        }
    }

    pub fn process(&self, reading: SensorReading) -> ProcessOutcome {
        let machine_id = reading.machine_id.clone();
        let state = derive_state(&reading.vibration, reading.speed, self.idle_speed);
        let store_id = self.store_id(&machine_id, state);

        let mut candidates = self.thresholds.evaluate(&reading);
        if let Some(point) = reading.position {
            candidates.extend(
                self.deps
                    .geofences
                    .check_position(&machine_id, point)
                    .iter()
                    .map(|event| event.to_alert()),
            );
        }
        if let Some(level) = reading.fuel_level {
            let update = self.deps.fuel.record_reading(&machine_id, level, reading.timestamp);
            candidates.extend(update.alerts);
        }

        let snapshot = MachineSnapshot {
            machine_id: machine_id.clone(),
            store_id,
            state,
            temperature: reading.temperature,
            vibration: reading.vibration,
            vibration_magnitude: reading.vibration.magnitude(),
            position: reading.position,
            speed: reading.speed,
            fuel_level: reading.fuel_level,
            engine_hours: reading.engine_hours,
            active_alerts: candidates.clone(),
            last_update: reading.timestamp,
        };
        self.deps.snapshots.upsert(snapshot.clone());

        let accepted = self.deps.dispatcher.dispatch(&machine_id, &candidates);
        self.deps.batcher.push(TelemetryRecord::from_reading(&reading, state));
        self.deps.hub.publish(snapshot);
        self.deps.health.reading_processed();

        debug!(
            machine_id = %machine_id,
            state = state.as_str(),
            candidates = candidates.len(),
            accepted = accepted.len(),
            "reading processed"
        );
        ProcessOutcome { machine_id, state, candidates, accepted }
    }

    /// Alerts raised by other services go through the same cooldown gate.
    pub fn process_external_alert(
        &self,
        payload: &[u8],
    ) -> Result<Vec<CandidateAlert>, ReadingError> {
        let external: ExternalAlert = serde_json::from_slice(payload).inspect_err(|e| {
            self.deps.health.reading_rejected();
            warn!("external alert rejected: {e}");
        })?;
        if external.machine_id.trim().is_empty() {
            self.deps.health.reading_rejected();
            return Err(ReadingError::EmptyId);
        }
        let (machine_id, alert) = external.into_candidate();
        Ok(self.deps.dispatcher.dispatch(&machine_id, &[alert]))
    }

    /// Store row id of the machine. Unknown machines are provisioned by the
    /// outbound workers; their readings carry no row id until then.
    fn store_id(&self, machine_id: &str, state: OperationalState) -> Option<String> {
        match self.deps.registry.lookup(machine_id) {
            Lookup::Known(id) => Some(id),
            Lookup::Waiting => None,
            Lookup::Provision => {
                self.deps.queue.push(Job::Provision(ProvisionJob {
                    machine_id: machine_id.to_string(),
                    fields: MachineFields { name: format!("Machine {machine_id}"), status: state },
                }));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::Duration;

    fn received() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::days(20_000)
    }

    fn parse(value: serde_json::Value) -> Result<SensorReading, ReadingError> {
        SensorReading::from_payload(value.to_string().as_bytes(), received())
    }

    #[test]
    fn test_parse_full_payload() {
        let reading = parse(json!({
            "id": "sim_001", "temp": 72.4, "vib_x": 0.12, "vib_y": 0.05, "vib_z": 0.02,
            "gps": [30.9, 75.85], "speed": 8.5, "fuel_level": 64.0, "engine_hours": 1203.5,
            "timestamp": 1_718_000_000_000u64, "mode": "idle"
        }))
        .unwrap();

        assert_eq!(reading.machine_id, "sim_001");
        assert_eq!(reading.position, Some(GeoPoint::new(30.9, 75.85)));
        assert_eq!(reading.fuel_level, Some(64.0));
        assert_eq!(reading.timestamp.unix_timestamp(), 1_718_000_000);
    }

    #[test]
    fn test_minimal_payload_defaults() {
        let payload = json!({ "id": "sim_002", "temp": 40, "vib_x": 0, "vib_y": 0, "vib_z": 0 });
        let reading = parse(payload).unwrap();
        assert_eq!(reading.position, None);
        assert_eq!(reading.speed, None);
        assert_eq!(reading.timestamp, received());
    }

    #[test]
    fn test_rejections() {
        assert!(matches!(
            parse(json!({ "id": "x", "temp": "hot", "vib_x": 0, "vib_y": 0, "vib_z": 0 })),
            Err(ReadingError::Malformed(_))
        ));
        assert!(matches!(
            parse(json!({ "id": "x", "temp": 40, "vib_x": 0, "vib_y": 0 })),
            Err(ReadingError::Malformed(_))
        ));
        assert!(matches!(
            parse(json!({ "id": "  ", "temp": 40, "vib_x": 0, "vib_y": 0, "vib_z": 0 })),
            Err(ReadingError::EmptyId)
        ));
        assert!(SensorReading::from_payload(b"not json", received()).is_err());
    }

    #[test]
    fn test_out_of_range_timestamp_falls_back_to_receive_time() {
        for ts in [json!(1e300), json!(1e35), json!(-1e300), json!(9.0e18)] {
            let reading = parse(json!({
                "id": "x", "temp": 40, "vib_x": 0.1, "vib_y": 0, "vib_z": 0, "timestamp": ts
            }))
            .unwrap();
            assert_eq!(reading.timestamp, received());
        }
    }

    #[test]
    fn test_bad_optional_fields_are_dropped() {
        let reading = parse(json!({
            "id": "x", "temp": 40, "vib_x": 0.1, "vib_y": 0, "vib_z": 0,
            "gps": [30.9], "fuel_level": 140.0
        }))
        .unwrap();
        assert_eq!(reading.position, None);
        assert_eq!(reading.fuel_level, None);
    }

    #[test]
    fn test_state_derivation() {
        let still = Vibration::default();
        let running = Vibration::new(0.1, 0.0, 0.0);

        assert_eq!(derive_state(&still, Some(10.0), 1.0), OperationalState::Off);
        assert_eq!(derive_state(&running, None, 1.0), OperationalState::Active);
        assert_eq!(derive_state(&running, Some(1.0), 1.0), OperationalState::Active);
        assert_eq!(derive_state(&running, Some(0.5), 1.0), OperationalState::Idle);
    }
}
