/**
 * IN-MEMORY STORE - Default backend of the kernel
 *
 * ROLE :
 * Keeps machines, telemetry, alerts, assignments and contacts in process
 * memory. Used when no remote store is configured and by every test.
 *
 * TEST HOOKS :
 * - `set_available(false)` makes every call fail with `Unavailable`
 * - `fail_next_upserts(n)` makes the next n upserts fail with `Conflict`
 */

use super::{MachineFields, MachineStore, StoreError, TelemetryRecord};
use crate::fuel::FuelSample;
use crate::geofence::Geofence;
use crate::models::AlertRecord;
use crate::notify::OwnerContact;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Default)]
pub struct InMemoryStore {
    offline: AtomicBool,
    pending_conflicts: AtomicUsize,
    upsert_calls: AtomicUsize,
    machines: Mutex<HashMap<String, (String, MachineFields)>>,
    telemetry: Mutex<Vec<TelemetryRecord>>,
    alerts: Mutex<Vec<AlertRecord>>,
    assignments: Mutex<Vec<(String, Geofence)>>,
    contacts: Mutex<HashMap<String, OwnerContact>>,
    fuel_log: Mutex<HashMap<String, Vec<FuelSample>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    pub fn fail_next_upserts(&self, n: usize) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn machine_count(&self) -> usize {
        self.machines.lock().len()
    }

    pub fn alerts(&self) -> Vec<AlertRecord> {
        self.alerts.lock().clone()
    }

    pub fn telemetry(&self) -> Vec<TelemetryRecord> {
        self.telemetry.lock().clone()
    }

    pub fn set_assignments(&self, assignments: Vec<(String, Geofence)>) {
        *self.assignments.lock() = assignments;
    }

    pub fn set_contact(&self, device_id: &str, contact: OwnerContact) {
        self.contacts.lock().insert(device_id.to_string(), contact);
    }

    pub fn push_fuel_history(&self, device_id: &str, sample: FuelSample) {
        self.fuel_log.lock().entry(device_id.to_string()).or_default().push(sample);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MachineStore for InMemoryStore {
    async fn upsert_machine(
        &self,
        device_id: &str,
        fields: &MachineFields,
    ) -> Result<String, StoreError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_available()?;

        let conflicts = self.pending_conflicts.load(Ordering::SeqCst);
        if conflicts > 0 {
            self.pending_conflicts.store(conflicts - 1, Ordering::SeqCst);
            // A concurrent writer won the race: the row exists afterwards.
            self.machines
                .lock()
                .entry(device_id.to_string())
                .or_insert_with(|| (Uuid::new_v4().to_string(), fields.clone()));
            return Err(StoreError::Conflict(format!("machine {device_id} already exists")));
        }

        let mut machines = self.machines.lock();
        let entry = machines
            .entry(device_id.to_string())
            .or_insert_with(|| (Uuid::new_v4().to_string(), fields.clone()));
        entry.1 = fields.clone();
        Ok(entry.0.clone())
    }

    async fn find_machine(&self, device_id: &str) -> Result<Option<String>, StoreError> {
        self.ensure_available()?;
        Ok(self.machines.lock().get(device_id).map(|(id, _)| id.clone()))
    }

    async fn batch_insert_telemetry(
        &self,
        records: &[TelemetryRecord],
    ) -> Result<usize, StoreError> {
        self.ensure_available()?;
        let mut fuel_log = self.fuel_log.lock();
        for record in records {
            if let Some(level) = record.fuel_level {
                fuel_log
                    .entry(record.device_id.clone())
                    .or_default()
                    .push(FuelSample { level, timestamp: record.timestamp });
            }
        }
        self.telemetry.lock().extend_from_slice(records);
        Ok(records.len())
    }

    async fn insert_alert(&self, alert: &AlertRecord) -> Result<AlertRecord, StoreError> {
        self.ensure_available()?;
        let mut stored = alert.clone();
        stored.id = Some(Uuid::new_v4().to_string());
        self.alerts.lock().push(stored.clone());
        Ok(stored)
    }

    async fn load_geofence_assignments(&self) -> Result<Vec<(String, Geofence)>, StoreError> {
        self.ensure_available()?;
        Ok(self.assignments.lock().clone())
    }

    async fn owner_contact(&self, device_id: &str) -> Result<Option<OwnerContact>, StoreError> {
        self.ensure_available()?;
        Ok(self.contacts.lock().get(device_id).cloned())
    }

    async fn fuel_history(
        &self,
        device_id: &str,
        since: OffsetDateTime,
    ) -> Result<Vec<FuelSample>, StoreError> {
        self.ensure_available()?;
        let mut samples: Vec<FuelSample> = self
            .fuel_log
            .lock()
            .get(device_id)
            .map(|all| all.iter().filter(|s| s.timestamp >= since).copied().collect())
            .unwrap_or_default();
        samples.sort_by_key(|s| s.timestamp);
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationalState;

    fn fields() -> MachineFields {
        MachineFields { name: "Machine sim_001".into(), status: OperationalState::Active }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = InMemoryStore::new();
        let a = store.upsert_machine("sim_001", &fields()).await.unwrap();
        let b = store.upsert_machine("sim_001", &fields()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.machine_count(), 1);
        assert_eq!(store.upsert_calls(), 2);
    }

    #[tokio::test]
    async fn test_conflict_leaves_row_resolvable() {
        let store = InMemoryStore::new();
        store.fail_next_upserts(1);
        let err = store.upsert_machine("sim_002", &fields()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.find_machine("sim_002").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_available(false);
        assert!(matches!(store.find_machine("x").await, Err(StoreError::Unavailable(_))));
        assert!(store.batch_insert_telemetry(&[]).await.is_err());
        store.set_available(true);
        assert_eq!(store.batch_insert_telemetry(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fuel_history_filters_and_sorts() {
        let store = InMemoryStore::new();
        let t0 = OffsetDateTime::UNIX_EPOCH;
        let later = FuelSample { level: 50.0, timestamp: t0 + time::Duration::hours(2) };
        let earlier = FuelSample { level: 60.0, timestamp: t0 + time::Duration::hours(1) };
        store.push_fuel_history("m", later);
        store.push_fuel_history("m", earlier);
        store.push_fuel_history("m", FuelSample { level: 70.0, timestamp: t0 });

        let samples = store.fuel_history("m", t0 + time::Duration::minutes(30)).await.unwrap();
        assert_eq!(samples.iter().map(|s| s.level).collect::<Vec<_>>(), vec![60.0, 50.0]);
    }
}
