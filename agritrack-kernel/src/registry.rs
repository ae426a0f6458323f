/**
 * MACHINE REGISTRY - Store row ids of known machines
 *
 * ROLE :
 * The ingest path only reads this cache. An unknown machine is reported
 * once as `Lookup::Provision`; the caller queues a provisioning job and the
 * outbound worker resolves it later, so a slow store never holds a shard.
 *
 * RETRY :
 * A machine waiting for its row is not re-queued before `PROVISION_RETRY`
 * has elapsed on the injected clock, whether the job failed or was dropped
 * from a full queue.
 */

use crate::clock::Clock;
use crate::store::{MachineFields, MachineStore, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

pub const PROVISION_RETRY: Duration = Duration::seconds(60);

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionJob {
    pub machine_id: String,
    pub fields: MachineFields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Known(String),
    /// Provisioning queued or failed recently.
    Waiting,
    /// Caller must queue a `ProvisionJob`.
    Provision,
}

enum Entry {
    Known(String),
    WaitingUntil(OffsetDateTime),
}

pub struct MachineRegistry {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MachineRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, entries: Mutex::new(HashMap::new()) }
    }

    /// Returns `Provision` at most once per retry window for a machine.
    pub fn lookup(&self, machine_id: &str) -> Lookup {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(machine_id) {
            Some(Entry::Known(id)) => Lookup::Known(id.clone()),
            Some(Entry::WaitingUntil(until)) if now < *until => Lookup::Waiting,
            _ => {
                entries.insert(machine_id.to_string(), Entry::WaitingUntil(now + PROVISION_RETRY));
                Lookup::Provision
            }
        }
    }

    pub fn store_id(&self, machine_id: &str) -> Option<String> {
        match self.entries.lock().get(machine_id) {
            Some(Entry::Known(id)) => Some(id.clone()),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upserts the machine, re-fetching its row on conflict, and records the
    /// outcome. Returns the row id on success.
    pub async fn provision(&self, store: &dyn MachineStore, job: &ProvisionJob) -> Option<String> {
        let machine_id = job.machine_id.as_str();
        let outcome = match store.upsert_machine(machine_id, &job.fields).await {
            Err(StoreError::Conflict(_)) => match store.find_machine(machine_id).await {
                Ok(Some(id)) => Ok(id),
                Ok(None) => Err(StoreError::Conflict(format!(
                    "{machine_id} conflicted but was not found"
                ))),
                Err(e) => Err(e),
            },
            other => other,
        };

        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match outcome {
            Ok(id) => {
                info!(machine_id = %machine_id, store_id = %id, "machine provisioned");
                entries.insert(machine_id.to_string(), Entry::Known(id.clone()));
                Some(id)
            }
            Err(e) => {
                warn!(
                    machine_id = %machine_id,
                    "provisioning failed, retrying in {}s: {e}",
                    PROVISION_RETRY.whole_seconds()
                );
                entries.insert(machine_id.to_string(), Entry::WaitingUntil(now + PROVISION_RETRY));
                None
            }
        }
    }
}
