//! Sharded ingestion workers. Each machine id hashes to one shard, each shard
//! is drained by a single task, so readings of a machine are processed in
//! arrival order and never concurrently.

use crate::telemetry::TelemetryIngestor;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Shard {0} is full")]
    Full(usize),
    #[error("Worker pool is closed")]
    Closed,
}

pub struct WorkerPool {
    shard_count: usize,
    /// None once shut down
    shards: Mutex<Option<Vec<mpsc::Sender<Vec<u8>>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

pub fn shard_for(machine_id: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    machine_id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// Cheap id extraction for routing; full validation happens in the shard.
fn routing_key(payload: &[u8]) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct Key {
        id: String,
    }
    serde_json::from_slice::<Key>(payload).ok().map(|k| k.id.trim().to_string())
}

impl WorkerPool {
    pub fn spawn(ingestor: Arc<TelemetryIngestor>, shards: usize, capacity: usize) -> Self {
        let shards = shards.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut handles = Vec::with_capacity(shards);

        for shard in 0..shards {
            let (tx, mut rx) = mpsc::channel::<Vec<u8>>(capacity);
            let ingestor = Arc::clone(&ingestor);
            handles.push(tokio::spawn(async move {
                while let Some(payload) = rx.recv().await {
                    // rejection is logged and counted by the ingestor
                    let run = panic::catch_unwind(AssertUnwindSafe(|| {
                        ingestor.process_payload(&payload)
                    }));
                    if run.is_err() {
                        error!(shard, "reading processing panicked, payload dropped");
                    }
                }
                debug!(shard, "ingest shard stopped");
            }));
            senders.push(tx);
        }

        Self {
            shard_count: shards,
            shards: Mutex::new(Some(senders)),
            handles: Mutex::new(handles),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    fn sender(&self, shard: usize) -> Result<mpsc::Sender<Vec<u8>>, SubmitError> {
        self.shards
            .lock()
            .as_ref()
            .map(|senders| senders[shard].clone())
            .ok_or(SubmitError::Closed)
    }

    /// Waits for room in the shard. Payloads without a parseable id go to
    /// shard 0, where the ingestor rejects them.
    pub async fn submit(&self, payload: Vec<u8>) -> Result<(), SubmitError> {
        let shard = self.route(&payload);
        let sender = self.sender(shard)?;
        sender.send(payload).await.map_err(|_| SubmitError::Closed)
    }

    /// Never waits: a full shard refuses the payload.
    pub fn try_submit(&self, payload: Vec<u8>) -> Result<(), SubmitError> {
        let shard = self.route(&payload);
        self.sender(shard)?.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(shard, "ingest shard full, reading dropped");
                SubmitError::Full(shard)
            }
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    fn route(&self, payload: &[u8]) -> usize {
        routing_key(payload)
            .map(|id| shard_for(&id, self.shard_count))
            .unwrap_or(0)
    }

    /// Closes intake and waits until every shard has drained.
    pub async fn shutdown(&self) {
        self.shards.lock().take();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::KernelConfig;
    use crate::notify::LogGateway;
    use crate::store::InMemoryStore;
    use crate::Kernel;

    fn kernel() -> Kernel {
        Kernel::new(
            KernelConfig::default(),
            Arc::new(InMemoryStore::new()),
            Arc::new(LogGateway),
            Arc::new(SystemClock),
        )
    }

    fn reading(id: &str, extra: &str) -> Vec<u8> {
        format!(r#"{{"id":"{id}","temp":60,"vib_x":0.1,"vib_y":0,"vib_z":0{extra}}}"#).into_bytes()
    }

    #[test]
    fn test_shard_is_stable_and_in_range() {
        for id in ["sim_001", "sim_002", "tractor-17", ""] {
            let a = shard_for(id, 4);
            assert_eq!(a, shard_for(id, 4));
            assert!(a < 4);
        }
        assert_eq!(shard_for("anything", 1), 0);
    }

    #[test]
    fn test_routing_key() {
        assert_eq!(routing_key(br#"{"id":" sim_001 ","temp":1}"#).as_deref(), Some("sim_001"));
        assert_eq!(routing_key(b"garbage"), None);
    }

    #[tokio::test]
    async fn test_shard_survives_extreme_timestamp() {
        let kernel = kernel();
        let pool = WorkerPool::spawn(kernel.ingestor.clone(), 1, 16);

        pool.submit(reading("sim_001", r#","timestamp":1e300"#)).await.unwrap();
        pool.submit(reading("sim_002", "")).await.unwrap();
        pool.shutdown().await;

        assert_eq!(kernel.health_report().readings_processed, 2);
        assert!(kernel.snapshots.get("sim_002").is_some());
    }

    #[tokio::test]
    async fn test_try_submit_refuses_when_shard_is_full() {
        let kernel = kernel();
        let pool = WorkerPool::spawn(kernel.ingestor.clone(), 1, 1);

        // the shard task has not run yet on this single-threaded runtime
        pool.try_submit(reading("sim_001", "")).unwrap();
        assert!(matches!(pool.try_submit(reading("sim_001", "")), Err(SubmitError::Full(0))));

        pool.shutdown().await;
        assert!(matches!(pool.try_submit(reading("sim_001", "")), Err(SubmitError::Closed)));
        assert_eq!(kernel.health_report().readings_processed, 1);
    }
}
