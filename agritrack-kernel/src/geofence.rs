/**
 * GEOFENCE ENGINE - Containment tracking and entry/exit transitions
 *
 * ROLE :
 * Holds the machine -> geofences assignment cache and, per machine, the set
 * of geofences that contained its last position. Each position check
 * recomputes the full set and reports the differences as transitions.
 *
 * GEOMETRY :
 * - circle : haversine distance <= radius (boundary counts as inside)
 * - polygon : even-odd ray casting on the outer ring (lng = x, lat = y),
 *   holes are not supported
 *
 * CONCURRENCY :
 * The assignment cache is an `Arc` swapped wholesale under a write lock, so
 * readers never see a partially refreshed map. Containment entries are only
 * written by the shard that owns the machine.
 */

use crate::config::GeofenceConf;
use crate::models::{AlertType, CandidateAlert, GeoPoint, Severity};
use crate::store::{MachineStore, StoreError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GeofenceShape {
    Circle { center: GeoPoint, radius_m: f64 },
    Polygon { ring: Vec<GeoPoint> },
}

impl GeofenceShape {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        match self {
            GeofenceShape::Circle { center, radius_m } => haversine_m(center, point) <= *radius_m,
            GeofenceShape::Polygon { ring } => point_in_ring(ring, point),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub id: String,
    pub name: String,
    pub shape: GeofenceShape,
    pub alert_on_entry: bool,
    pub alert_on_exit: bool,
    pub active: bool,
    pub owner_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Entry,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeofenceEvent {
    pub machine_id: String,
    pub geofence_id: String,
    pub geofence_name: String,
    pub kind: TransitionKind,
    pub position: GeoPoint,
}

impl GeofenceEvent {
    pub fn to_alert(&self) -> CandidateAlert {
        let (alert_type, verb) = match self.kind {
            TransitionKind::Entry => (AlertType::GeofenceEntry, "entered"),
            TransitionKind::Exit => (AlertType::GeofenceExit, "left"),
        };
        CandidateAlert::new(
            alert_type,
            Severity::Warning,
            format!("Machine {} {} geofence {}", self.machine_id, verb, self.geofence_name),
            json!({
                "geofence_id": self.geofence_id,
                "geofence_name": self.geofence_name,
                "lat": self.position.lat,
                "lng": self.position.lng,
            }),
        )
    }
}

type AssignmentMap = HashMap<String, Vec<Geofence>>;

struct Containment {
    inside: HashSet<String>,
    touched: Instant,
}

pub struct GeofenceEngine {
    assignments: RwLock<Arc<AssignmentMap>>,
    containment: Mutex<HashMap<String, Containment>>,
    report_entry_on_first_fix: bool,
}

impl GeofenceEngine {
    pub fn new(conf: &GeofenceConf) -> Self {
        Self {
            assignments: RwLock::new(Arc::new(HashMap::new())),
            containment: Mutex::new(HashMap::new()),
            report_entry_on_first_fix: conf.report_entry_on_first_fix,
        }
    }

    /// Reloads the assignment cache. On failure the previous cache is kept.
    pub async fn refresh_assignments(&self, store: &dyn MachineStore) -> Result<usize, StoreError> {
        match store.load_geofence_assignments().await {
            Ok(list) => {
                let count = self.replace_assignments(list);
                info!(assignments = count, "geofence assignments refreshed");
                Ok(count)
            }
            Err(e) => {
                warn!("geofence refresh failed, keeping previous assignments: {e}");
                Err(e)
            }
        }
    }

    pub fn replace_assignments(&self, list: Vec<(String, Geofence)>) -> usize {
        let count = list.len();
        let mut map: AssignmentMap = HashMap::new();
        for (machine_id, fence) in list {
            map.entry(machine_id).or_default().push(fence);
        }
        *self.assignments.write() = Arc::new(map);
        count
    }

    pub fn assigned(&self, machine_id: &str) -> Vec<Geofence> {
        self.assignments.read().get(machine_id).cloned().unwrap_or_default()
    }

    /// Geofence ids currently containing the machine.
    pub fn containment_of(&self, machine_id: &str) -> HashSet<String> {
        self.containment
            .lock()
            .get(machine_id)
            .map(|c| c.inside.clone())
            .unwrap_or_default()
    }

    pub fn check_position(&self, machine_id: &str, point: GeoPoint) -> Vec<GeofenceEvent> {
        if !point.is_valid() {
            return Vec::new();
        }

        let assignments = Arc::clone(&self.assignments.read());
        let fences: Vec<&Geofence> = assignments
            .get(machine_id)
            .map(|list| list.iter().filter(|f| f.active).collect())
            .unwrap_or_default();

        let now_inside: HashSet<String> = fences
            .iter()
            .filter(|f| f.shape.contains(&point))
            .map(|f| f.id.clone())
            .collect();

        let mut containment = self.containment.lock();
        let first_fix = !containment.contains_key(machine_id);
        let entry = containment.entry(machine_id.to_string()).or_insert_with(|| Containment {
            inside: HashSet::new(),
            touched: Instant::now(),
        });

        let mut events = Vec::new();
        if !(first_fix && !self.report_entry_on_first_fix) {
            for fence in &fences {
                let was = entry.inside.contains(&fence.id);
                let is = now_inside.contains(&fence.id);
                let kind = match (was, is) {
                    (false, true) if fence.alert_on_entry => TransitionKind::Entry,
                    (true, false) if fence.alert_on_exit => TransitionKind::Exit,
                    _ => continue,
                };
                events.push(GeofenceEvent {
                    machine_id: machine_id.to_string(),
                    geofence_id: fence.id.clone(),
                    geofence_name: fence.name.clone(),
                    kind,
                    position: point,
                });
            }
        }

        entry.inside = now_inside;
        entry.touched = Instant::now();
        events
    }

    /// Drops containment entries not updated within `ttl`. Returns how many went.
    pub fn forget_idle(&self, ttl: Duration) -> usize {
        let mut containment = self.containment.lock();
        let before = containment.len();
        containment.retain(|_, c| c.touched.elapsed() < ttl);
        before - containment.len()
    }
}

pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = (b.lat - a.lat).to_radians();
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

fn point_in_ring(ring: &[GeoPoint], point: &GeoPoint) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let (x, y) = (point.lng, point.lat);
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (xi, yi) = (ring[i].lng, ring[i].lat);
        let (xj, yj) = (ring[j].lng, ring[j].lat);
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}
