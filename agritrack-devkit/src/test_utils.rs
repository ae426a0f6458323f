/*!
Test harness for the AgriTrack kernel

Assembles a complete `Kernel` over an in-memory store, a recording
notification gateway and a manual clock. Readings go straight to the
ingestor; the outbound queue is drained inline so side effects can be
asserted without spawned workers.
*/

use crate::fixtures::TelemetryMessageBuilder;
use crate::notify_stub::RecordingGateway;
use agritrack_kernel::clock::ManualClock;
use agritrack_kernel::config::KernelConfig;
use agritrack_kernel::models::{AlertRecord, AlertType, MachineSnapshot};
use agritrack_kernel::outbound;
use agritrack_kernel::store::InMemoryStore;
use agritrack_kernel::telemetry::{ProcessOutcome, ReadingError};
use agritrack_kernel::Kernel;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Harvest season, fixed so timestamps are reproducible.
pub fn test_epoch() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + time::Duration::days(20_000)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("agritrack_kernel=debug")
        .with_test_writer()
        .try_init();
}

pub struct TestHarness {
    pub kernel: Arc<Kernel>,
    pub store: Arc<InMemoryStore>,
    pub gateway: Arc<RecordingGateway>,
    pub clock: Arc<ManualClock>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        init_tracing();
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(RecordingGateway::new());
        let clock = Arc::new(ManualClock::new(test_epoch()));
        let kernel = Arc::new(Kernel::new(config, store.clone(), gateway.clone(), clock.clone()));
        Self { kernel, store, gateway, clock }
    }

    pub fn advance(&self, secs: i64) {
        self.clock.advance(time::Duration::seconds(secs));
    }

    pub fn send_payload(&self, payload: &[u8]) -> Result<ProcessOutcome, ReadingError> {
        self.kernel.ingestor.process_payload(payload)
    }

    /// Sends a built reading, erroring on rejection.
    pub fn send(&self, reading: TelemetryMessageBuilder) -> Result<ProcessOutcome> {
        Ok(self.send_payload(&reading.bytes())?)
    }

    /// Executes every queued outbound job on the current task, provisioning
    /// included.
    pub async fn drain_outbound(&self) -> usize {
        let ctx = self.kernel.outbound_context();
        let mut executed = 0;
        while let Some(job) = self.kernel.queue.try_pop() {
            outbound::execute(&ctx, job).await;
            executed += 1;
        }
        executed
    }

    /// Flushes pending telemetry, then drains.
    pub async fn settle(&self) -> usize {
        self.kernel.batcher.flush();
        self.drain_outbound().await
    }

    pub fn snapshot(&self, machine_id: &str) -> Option<MachineSnapshot> {
        self.kernel.snapshots.get(machine_id)
    }

    pub fn persisted_alerts(&self, machine_id: &str) -> Vec<AlertRecord> {
        self.store
            .alerts()
            .into_iter()
            .filter(|a| a.machine_id == machine_id)
            .collect()
    }

    pub fn count_alerts(&self, machine_id: &str, alert_type: &AlertType) -> usize {
        self.persisted_alerts(machine_id)
            .iter()
            .filter(|a| &a.alert_type == alert_type)
            .count()
    }

    /// Polls until `check` holds or the timeout elapses.
    pub async fn wait_until<F>(&self, timeout_ms: u64, mut check: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_harness_processes_and_persists() {
        let harness = TestHarness::new();
        let outcome = harness.send(TelemetryMessageBuilder::new("sim_001")).unwrap();
        assert!(outcome.accepted.is_empty());
        assert_eq!(harness.snapshot("sim_001").unwrap().store_id, None);

        harness.settle().await;
        assert_eq!(harness.store.machine_count(), 1);
        assert_eq!(harness.store.telemetry().len(), 1);
        assert!(harness.snapshot("sim_001").unwrap().store_id.is_some());
    }
}
