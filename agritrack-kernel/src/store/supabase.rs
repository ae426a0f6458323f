/**
 * SUPABASE STORE - PostgREST backend
 *
 * ROLE :
 * Implements `MachineStore` against the Supabase REST surface
 * (`<url>/rest/v1/<table>`), authenticated with the service key.
 *
 * TABLES / VIEWS :
 * - machines (device_id unique) : upsert with merge-duplicates
 * - sensor_logs : telemetry batches, fuel history
 * - alerts : alert records
 * - geofence_assignments : flat view, one row per (device, geofence)
 * - machine_owner_contacts : view joining machines to their owner profile
 */

use super::{MachineFields, MachineStore, StoreError, TelemetryRecord};
use crate::config::StoreConf;
use crate::fuel::FuelSample;
use crate::geofence::{Geofence, GeofenceShape};
use crate::models::{AlertRecord, GeoPoint};
use crate::notify::OwnerContact;
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};

pub struct SupabaseStore {
    client: reqwest::Client,
    base: String,
    key: String,
}

#[derive(Debug, Deserialize)]
struct AssignmentRow {
    device_id: String,
    geofence_id: Value,
    name: String,
    shape_type: String,
    center_lat: Option<f64>,
    center_lng: Option<f64>,
    radius_m: Option<f64>,
    /// `[[lat, lng], ...]`
    coordinates: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    alert_on_entry: bool,
    #[serde(default)]
    alert_on_exit: bool,
    #[serde(default = "default_true")]
    is_active: bool,
    owner_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ContactRow {
    owner_name: Option<String>,
    #[serde(default)]
    push_tokens: Option<Vec<String>>,
    phone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FuelRow {
    fuel_level: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

fn default_true() -> bool {
    true
}

/// Row ids may be uuids or bigints depending on the table.
fn id_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl AssignmentRow {
    fn into_assignment(self) -> Option<(String, Geofence)> {
        let id = id_to_string(&self.geofence_id)?;
        let shape = match self.shape_type.as_str() {
            "circle" => GeofenceShape::Circle {
                center: GeoPoint::new(self.center_lat?, self.center_lng?),
                radius_m: self.radius_m?,
            },
            "polygon" => GeofenceShape::Polygon {
                ring: self
                    .coordinates?
                    .into_iter()
                    .map(|[lat, lng]| GeoPoint::new(lat, lng))
                    .collect(),
            },
            _ => return None,
        };
        Some((
            self.device_id,
            Geofence {
                id,
                name: self.name,
                shape,
                alert_on_entry: self.alert_on_entry,
                alert_on_exit: self.alert_on_exit,
                active: self.is_active,
                owner_id: self.owner_id.as_ref().and_then(id_to_string),
            },
        ))
    }
}

impl SupabaseStore {
    pub fn new(conf: &StoreConf) -> Result<Self, StoreError> {
        let base = conf
            .url
            .as_deref()
            .ok_or_else(|| StoreError::Unavailable("store.url not configured".into()))?
            .trim_end_matches('/')
            .to_string();
        let key = conf
            .service_key
            .clone()
            .ok_or_else(|| StoreError::Unavailable("SUPABASE_SERVICE_KEY not set".into()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(conf.timeout_secs))
            .build()?;
        Ok(Self { client, base, key })
    }

    fn table(&self, name: &str) -> String {
        format!("{}/rest/v1/{}", self.base, name)
    }

    fn get(&self, table: &str) -> reqwest::RequestBuilder {
        self.client
            .get(self.table(table))
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }

    fn post(&self, table: &str, prefer: &str) -> reqwest::RequestBuilder {
        self.client
            .post(self.table(table))
            .header("apikey", &self.key)
            .header("Prefer", prefer)
            .bearer_auth(&self.key)
    }

    async fn check(response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT {
            return Err(StoreError::Conflict(body));
        }
        Err(StoreError::Rejected { status: status.as_u16(), body })
    }

    fn first_id(rows: &[Value]) -> Option<String> {
        rows.first().and_then(|row| row.get("id")).and_then(id_to_string)
    }
}

#[async_trait]
impl MachineStore for SupabaseStore {
    async fn upsert_machine(
        &self,
        device_id: &str,
        fields: &MachineFields,
    ) -> Result<String, StoreError> {
        let body = json!([{
            "device_id": device_id,
            "name": fields.name,
            "status": fields.status,
        }]);
        let response = self
            .post("machines", "resolution=merge-duplicates,return=representation")
            .query(&[("on_conflict", "device_id")])
            .json(&body)
            .send()
            .await?;
        let rows: Vec<Value> = Self::check(response).await?.json().await?;
        Self::first_id(&rows).ok_or_else(|| StoreError::Rejected {
            status: 200,
            body: format!("upsert of {device_id} returned no id"),
        })
    }

    async fn find_machine(&self, device_id: &str) -> Result<Option<String>, StoreError> {
        let response = self
            .get("machines")
            .query(&[
                ("device_id", format!("eq.{device_id}")),
                ("select", "id".into()),
                ("limit", "1".into()),
            ])
            .send()
            .await?;
        let rows: Vec<Value> = Self::check(response).await?.json().await?;
        Ok(Self::first_id(&rows))
    }

    async fn batch_insert_telemetry(
        &self,
        records: &[TelemetryRecord],
    ) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let response = self.post("sensor_logs", "return=minimal").json(records).send().await?;
        Self::check(response).await?;
        debug!(count = records.len(), "telemetry batch stored");
        Ok(records.len())
    }

    async fn insert_alert(&self, alert: &AlertRecord) -> Result<AlertRecord, StoreError> {
        let body = json!({
            "type": alert.alert_type,
            "severity": alert.severity,
            "message": alert.message,
            "machine_id": alert.machine_id,
            "data": alert.data,
            "acknowledged": alert.acknowledged,
            "created_at": alert.created_at.format(&Rfc3339).unwrap_or_default(),
        });
        let response = self.post("alerts", "return=representation").json(&body).send().await?;
        let rows: Vec<Value> = Self::check(response).await?.json().await?;
        let mut stored = alert.clone();
        stored.id = Self::first_id(&rows);
        Ok(stored)
    }

    async fn load_geofence_assignments(&self) -> Result<Vec<(String, Geofence)>, StoreError> {
        let response = self.get("geofence_assignments").query(&[("select", "*")]).send().await?;
        let rows: Vec<AssignmentRow> = Self::check(response).await?.json().await?;
        let total = rows.len();
        let assignments: Vec<_> =
            rows.into_iter().filter_map(AssignmentRow::into_assignment).collect();
        if assignments.len() < total {
            let skipped = total - assignments.len();
            warn!(skipped, "geofence rows with incomplete shape skipped");
        }
        Ok(assignments)
    }

    async fn owner_contact(&self, device_id: &str) -> Result<Option<OwnerContact>, StoreError> {
        let response = self
            .get("machine_owner_contacts")
            .query(&[
                ("device_id", format!("eq.{device_id}")),
                ("select", "owner_name,push_tokens,phone".into()),
                ("limit", "1".into()),
            ])
            .send()
            .await?;
        let rows: Vec<ContactRow> = Self::check(response).await?.json().await?;
        Ok(rows.into_iter().next().map(|row| OwnerContact {
            owner_name: row.owner_name.unwrap_or_default(),
            push_tokens: row.push_tokens.unwrap_or_default(),
            phone: row.phone,
        }))
    }

    async fn fuel_history(
        &self,
        device_id: &str,
        since: OffsetDateTime,
    ) -> Result<Vec<FuelSample>, StoreError> {
        let since = since
            .format(&Rfc3339)
            .map_err(|e| StoreError::Unavailable(format!("cannot format timestamp: {e}")))?;
        let response = self
            .get("sensor_logs")
            .query(&[
                ("device_id", format!("eq.{device_id}")),
                ("timestamp", format!("gte.{since}")),
                ("fuel_level", "not.is.null".into()),
                ("select", "fuel_level,timestamp".into()),
                ("order", "timestamp.asc".into()),
            ])
            .send()
            .await?;
        let rows: Vec<FuelRow> = Self::check(response).await?.json().await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let timestamp = row.timestamp;
                row.fuel_level.map(|level| FuelSample { level, timestamp })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(value: Value) -> AssignmentRow {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_circle_row_conversion() {
        let (device, fence) = row(json!({
            "device_id": "sim_001",
            "geofence_id": 7,
            "name": "North field",
            "shape_type": "circle",
            "center_lat": 30.9,
            "center_lng": 75.85,
            "radius_m": 500.0,
            "alert_on_entry": true,
            "owner_id": "u-1"
        }))
        .into_assignment()
        .unwrap();

        assert_eq!(device, "sim_001");
        assert_eq!(fence.id, "7");
        assert!(fence.active);
        assert!(!fence.alert_on_exit);
        assert_eq!(fence.owner_id.as_deref(), Some("u-1"));
        assert!(matches!(fence.shape, GeofenceShape::Circle { radius_m, .. } if radius_m == 500.0));
    }

    #[test]
    fn test_polygon_row_conversion() {
        let (_, fence) = row(json!({
            "device_id": "sim_002",
            "geofence_id": "a1b2",
            "name": "Depot",
            "shape_type": "polygon",
            "coordinates": [[30.0, 75.0], [30.0, 75.1], [30.1, 75.1]],
            "is_active": false
        }))
        .into_assignment()
        .unwrap();

        assert!(!fence.active);
        match fence.shape {
            GeofenceShape::Polygon { ring } => assert_eq!(ring.len(), 3),
            other => panic!("unexpected shape {other:?}"),
        }
    }

    #[test]
    fn test_incomplete_rows_are_skipped() {
        let missing_radius = row(json!({
            "device_id": "sim_001", "geofence_id": 1, "name": "x",
            "shape_type": "circle", "center_lat": 1.0, "center_lng": 1.0
        }));
        assert!(missing_radius.into_assignment().is_none());

        let unknown_shape = row(json!({
            "device_id": "sim_001", "geofence_id": 1, "name": "x", "shape_type": "ellipse"
        }));
        assert!(unknown_shape.into_assignment().is_none());
    }

    #[test]
    fn test_new_requires_url_and_key() {
        let mut conf = StoreConf::default();
        assert!(SupabaseStore::new(&conf).is_err());
        conf.url = Some("https://project.supabase.co/".into());
        assert!(SupabaseStore::new(&conf).is_err());
        conf.service_key = Some("secret".into());
        let store = SupabaseStore::new(&conf).unwrap();
        assert_eq!(store.table("alerts"), "https://project.supabase.co/rest/v1/alerts");
    }
}
