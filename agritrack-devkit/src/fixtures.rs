/*!
Payload builders and geofence fixtures

`TelemetryMessageBuilder` produces the JSON the field simulator publishes on
the telemetry topic; geofence helpers build fences around a point.
*/

use agritrack_kernel::geofence::{Geofence, GeofenceShape};
use agritrack_kernel::models::GeoPoint;
use serde_json::{json, Map, Value};

/// Ludhiana farmland, the simulator's default area.
pub const FIELD_CENTER: GeoPoint = GeoPoint { lat: 30.9010, lng: 75.8573 };

#[derive(Debug, Clone)]
pub struct TelemetryMessageBuilder {
    fields: Map<String, Value>,
}

impl TelemetryMessageBuilder {
    /// Healthy, moving machine with no GPS or fuel data.
    pub fn new(machine_id: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("id".into(), json!(machine_id));
        fields.insert("temp".into(), json!(72.0));
        fields.insert("vib_x".into(), json!(0.12));
        fields.insert("vib_y".into(), json!(0.05));
        fields.insert("vib_z".into(), json!(0.02));
        fields.insert("speed".into(), json!(8.0));
        Self { fields }
    }

    pub fn temp(mut self, temp: f64) -> Self {
        self.fields.insert("temp".into(), json!(temp));
        self
    }

    pub fn vibration(mut self, x: f64, y: f64, z: f64) -> Self {
        self.fields.insert("vib_x".into(), json!(x));
        self.fields.insert("vib_y".into(), json!(y));
        self.fields.insert("vib_z".into(), json!(z));
        self
    }

    pub fn speed(mut self, speed: f64) -> Self {
        self.fields.insert("speed".into(), json!(speed));
        self
    }

    pub fn without_speed(mut self) -> Self {
        self.fields.remove("speed");
        self
    }

    pub fn gps(mut self, point: GeoPoint) -> Self {
        self.fields.insert("gps".into(), json!([point.lat, point.lng]));
        self
    }

    pub fn fuel(mut self, level: f64) -> Self {
        self.fields.insert("fuel_level".into(), json!(level));
        self
    }

    pub fn engine_hours(mut self, hours: f64) -> Self {
        self.fields.insert("engine_hours".into(), json!(hours));
        self
    }

    pub fn timestamp_ms(mut self, ms: i64) -> Self {
        self.fields.insert("timestamp".into(), json!(ms));
        self
    }

    /// Arbitrary field, including invalid values for rejection tests.
    pub fn field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn build(self) -> Value {
        Value::Object(self.fields)
    }

    pub fn bytes(self) -> Vec<u8> {
        self.build().to_string().into_bytes()
    }
}

pub fn external_alert(machine_id: &str, alert_type: &str, message: &str) -> Vec<u8> {
    json!({
        "machine_id": machine_id,
        "type": alert_type,
        "severity": "warning",
        "message": message,
    })
    .to_string()
    .into_bytes()
}

pub fn circle_fence(id: &str, center: GeoPoint, radius_m: f64) -> Geofence {
    Geofence {
        id: id.into(),
        name: format!("Field {id}"),
        shape: GeofenceShape::Circle { center, radius_m },
        alert_on_entry: true,
        alert_on_exit: true,
        active: true,
        owner_id: Some("owner-1".into()),
    }
}

/// Axis-aligned square of `half_side_deg` around `center`.
pub fn square_fence(id: &str, center: GeoPoint, half_side_deg: f64) -> Geofence {
    let (lat, lng, d) = (center.lat, center.lng, half_side_deg);
    Geofence {
        id: id.into(),
        name: format!("Field {id}"),
        shape: GeofenceShape::Polygon {
            ring: vec![
                GeoPoint::new(lat - d, lng - d),
                GeoPoint::new(lat - d, lng + d),
                GeoPoint::new(lat + d, lng + d),
                GeoPoint::new(lat + d, lng - d),
            ],
        },
        alert_on_entry: true,
        alert_on_exit: true,
        active: true,
        owner_id: Some("owner-1".into()),
    }
}

/// A point roughly `metres` north of `from`.
pub fn north_of(from: GeoPoint, metres: f64) -> GeoPoint {
    GeoPoint::new(from.lat + metres / 111_195.0, from.lng)
}
