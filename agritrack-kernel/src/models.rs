use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use time::OffsetDateTime;

/// Tri-axis vibration vector as reported by the machine accelerometer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vibration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vibration {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Finite and inside WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationalState {
    Active,
    Idle,
    Off,
}

impl OperationalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationalState::Active => "active",
            OperationalState::Idle => "idle",
            OperationalState::Off => "off",
        }
    }
}

/// Normalized telemetry reading. Only lives on the ingest path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub machine_id: String,
    pub temperature: f64,
    pub vibration: Vibration,
    pub position: Option<GeoPoint>,
    pub speed: Option<f64>,
    pub fuel_level: Option<f64>,
    pub engine_hours: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Alert kinds known to the kernel. Anything else travels as `Unclassified`
/// and gets the default cooldown and notification policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AlertType {
    Overheat,
    Vibration,
    GeofenceEntry,
    GeofenceExit,
    FuelLow,
    FuelCritical,
    FuelAnomaly,
    Maintenance,
    Unclassified(String),
}

impl AlertType {
    pub fn as_str(&self) -> &str {
        match self {
            AlertType::Overheat => "overheat",
            AlertType::Vibration => "vibration",
            AlertType::GeofenceEntry => "geofence_entry",
            AlertType::GeofenceExit => "geofence_exit",
            AlertType::FuelLow => "fuel_low",
            AlertType::FuelCritical => "fuel_critical",
            AlertType::FuelAnomaly => "fuel_anomaly",
            AlertType::Maintenance => "maintenance",
            AlertType::Unclassified(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name {
            "overheat" => AlertType::Overheat,
            "vibration" => AlertType::Vibration,
            "geofence_entry" => AlertType::GeofenceEntry,
            "geofence_exit" => AlertType::GeofenceExit,
            "fuel_low" => AlertType::FuelLow,
            "fuel_critical" => AlertType::FuelCritical,
            "fuel_anomaly" => AlertType::FuelAnomaly,
            "maintenance" => AlertType::Maintenance,
            other => AlertType::Unclassified(other.to_string()),
        }
    }

    /// Key used to look up cooldown windows and channel policies.
    /// Entry and exit share the `geofence` class.
    pub fn policy_class(&self) -> &str {
        match self {
            AlertType::GeofenceEntry | AlertType::GeofenceExit => "geofence",
            other => other.as_str(),
        }
    }
}

impl From<String> for AlertType {
    fn from(value: String) -> Self {
        AlertType::parse(&value)
    }
}

impl From<AlertType> for String {
    fn from(value: AlertType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert produced by a detector, before cooldown and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateAlert {
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl CandidateAlert {
    pub fn new(
        alert_type: AlertType,
        severity: Severity,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self { alert_type, severity, message: message.into(), data }
    }
}

/// Alert as persisted downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub machine_id: String,
    pub data: serde_json::Value,
    pub acknowledged: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl AlertRecord {
    pub fn from_candidate(
        machine_id: &str,
        alert: &CandidateAlert,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            id: None,
            alert_type: alert.alert_type.clone(),
            severity: alert.severity,
            message: alert.message.clone(),
            machine_id: machine_id.to_string(),
            data: alert.data.clone(),
            acknowledged: false,
            created_at,
        }
    }
}

/// Latest derived state of one machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineSnapshot {
    pub machine_id: String,
    pub store_id: Option<String>,
    pub state: OperationalState,
    pub temperature: f64,
    pub vibration: Vibration,
    pub vibration_magnitude: f64,
    pub position: Option<GeoPoint>,
    pub speed: Option<f64>,
    pub fuel_level: Option<f64>,
    pub engine_hours: Option<f64>,
    pub active_alerts: Vec<CandidateAlert>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
}

pub type SnapshotMap = HashMap<String, MachineSnapshot>;
