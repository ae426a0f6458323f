//! Latest derived state per machine and its live fan-out.

use crate::models::{MachineSnapshot, OperationalState, Severity, SnapshotMap};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Process-wide map machine id -> latest snapshot. Written only by the shard
/// owning the machine, read by HTTP handlers and the live fan-out.
#[derive(Default)]
pub struct MachineStateStore {
    snapshots: RwLock<SnapshotMap>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetOverview {
    pub total_machines: usize,
    pub active_machines: usize,
    pub machines_by_state: BTreeMap<&'static str, usize>,
    pub machines_with_alerts: usize,
    pub critical_machines: Vec<String>,
    pub alerts_by_type: BTreeMap<String, usize>,
    pub fleet_health: &'static str,
}

impl MachineStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, snapshot: MachineSnapshot) {
        self.snapshots.write().insert(snapshot.machine_id.clone(), snapshot);
    }

    /// Backfills the row id once provisioning completes. False when the
    /// machine has no snapshot.
    pub fn set_store_id(&self, machine_id: &str, store_id: &str) -> bool {
        match self.snapshots.write().get_mut(machine_id) {
            Some(snapshot) => {
                snapshot.store_id = Some(store_id.to_string());
                true
            }
            None => false,
        }
    }

    pub fn get(&self, machine_id: &str) -> Option<MachineSnapshot> {
        self.snapshots.read().get(machine_id).cloned()
    }

    /// Sorted by machine id.
    pub fn all(&self) -> Vec<MachineSnapshot> {
        let mut all: Vec<MachineSnapshot> = self.snapshots.read().values().cloned().collect();
        all.sort_by(|a, b| a.machine_id.cmp(&b.machine_id));
        all
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fleet_overview(&self) -> FleetOverview {
        let snapshots = self.snapshots.read();
        let mut machines_by_state = BTreeMap::new();
        let mut alerts_by_type = BTreeMap::new();
        let mut machines_with_alerts = 0;
        let mut critical_machines = Vec::new();

        for snapshot in snapshots.values() {
            *machines_by_state.entry(snapshot.state.as_str()).or_insert(0) += 1;
            if !snapshot.active_alerts.is_empty() {
                machines_with_alerts += 1;
            }
            for alert in &snapshot.active_alerts {
                *alerts_by_type.entry(alert.alert_type.to_string()).or_insert(0) += 1;
            }
            if snapshot.active_alerts.iter().any(|a| a.severity == Severity::Critical) {
                critical_machines.push(snapshot.machine_id.clone());
            }
        }
        critical_machines.sort();

        let fleet_health = match critical_machines.len() {
            0 => "Good",
            1 | 2 => "At Risk",
            _ => "Critical",
        };

        FleetOverview {
            total_machines: snapshots.len(),
            active_machines: machines_by_state
                .get(OperationalState::Active.as_str())
                .copied()
                .unwrap_or(0),
            machines_by_state,
            machines_with_alerts,
            critical_machines,
            alerts_by_type,
            fleet_health,
        }
    }
}

/// Broadcasts every new snapshot to live subscribers. A subscriber first
/// receives the full current set, then each update.
pub struct SnapshotHub {
    sender: broadcast::Sender<MachineSnapshot>,
}

impl SnapshotHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Returns how many subscribers got it.
    pub fn publish(&self, snapshot: MachineSnapshot) -> usize {
        self.sender.send(snapshot).unwrap_or(0)
    }

    pub fn subscribe(
        &self,
        store: &MachineStateStore,
    ) -> (Vec<MachineSnapshot>, broadcast::Receiver<MachineSnapshot>) {
        // receiver first so nothing published in between is missed
        let receiver = self.sender.subscribe();
        (store.all(), receiver)
    }

    pub fn subscribers(&self) -> usize {
        self.sender.receiver_count()
    }
}
