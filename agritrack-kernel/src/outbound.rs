/**
 * OUTBOUND QUEUE - Background side effects of the ingest path
 *
 * ROLE :
 * Machine provisioning, alert persistence, owner notifications and
 * telemetry batches are queued here and executed by a small pool of
 * worker tasks, so detection never waits on the network.
 *
 * POLICY :
 * - bounded : when full the oldest job is dropped and counted, producers
 *   never block
 * - best effort : a failed job is logged and counted, never retried
 * - shutdown : intake stops, workers drain what is left up to a timeout
 */

use crate::health::HealthTracker;
use crate::models::{AlertRecord, CandidateAlert};
use crate::notify::{ContactDirectory, NotificationGateway};
use crate::registry::{MachineRegistry, ProvisionJob};
use crate::snapshots::MachineStateStore;
use crate::store::{MachineStore, TelemetryRecord};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct NotifyJob {
    pub machine_id: String,
    pub alert: CandidateAlert,
    pub push: bool,
    pub sms: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Provision(ProvisionJob),
    PersistAlert(AlertRecord),
    Notify(NotifyJob),
    TelemetryBatch(Vec<TelemetryRecord>),
}

impl Job {
    fn kind(&self) -> &'static str {
        match self {
            Job::Provision(_) => "provision",
            Job::PersistAlert(_) => "persist_alert",
            Job::Notify(_) => "notify",
            Job::TelemetryBatch(_) => "telemetry_batch",
        }
    }
}

/// Collaborators a worker needs to execute jobs.
#[derive(Clone)]
pub struct OutboundContext {
    pub store: Arc<dyn MachineStore>,
    pub gateway: Arc<dyn NotificationGateway>,
    pub contacts: Arc<ContactDirectory>,
    pub registry: Arc<MachineRegistry>,
    pub snapshots: Arc<MachineStateStore>,
    pub health: HealthTracker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drained: bool,
    pub leftover: usize,
}

pub struct OutboundQueue {
    capacity: usize,
    jobs: Mutex<VecDeque<Job>>,
    wake: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    health: HealthTracker,
}

impl OutboundQueue {
    pub fn new(capacity: usize, health: HealthTracker) -> Self {
        Self {
            capacity,
            jobs: Mutex::new(VecDeque::with_capacity(capacity)),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            health,
        }
    }

    /// Returns false once the queue is closed.
    pub fn push(&self, job: Job) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            debug!(job = job.kind(), "outbound queue closed, job refused");
            return false;
        }
        {
            let mut jobs = self.jobs.lock();
            if jobs.len() >= self.capacity {
                if let Some(oldest) = jobs.pop_front() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    self.health.outbound_dropped();
                    warn!(dropped = oldest.kind(), "outbound queue full, oldest job dropped");
                }
            }
            jobs.push_back(job);
        }
        self.wake.notify_one();
        true
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pops without waiting.
    pub fn try_pop(&self) -> Option<Job> {
        self.jobs.lock().pop_front()
    }

    /// Next job, or None once the queue is closed and empty.
    pub async fn next(&self) -> Option<Job> {
        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_pop() {
                return Some(job);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        ctx: OutboundContext,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let queue = Arc::clone(self);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    while let Some(job) = queue.next().await {
                        execute(&ctx, job).await;
                    }
                    debug!(worker, "outbound worker stopped");
                })
            })
            .collect()
    }

    /// Stops intake and waits for the workers to drain the queue.
    pub async fn shutdown(
        &self,
        workers: Vec<JoinHandle<()>>,
        timeout: Duration,
    ) -> ShutdownReport {
        self.close();
        let drained = tokio::time::timeout(timeout, futures::future::join_all(workers))
            .await
            .is_ok();
        let leftover = self.len();
        if drained {
            info!("outbound queue drained");
        } else {
            warn!(leftover, "outbound drain timed out");
        }
        ShutdownReport { drained, leftover }
    }
}

pub async fn execute(ctx: &OutboundContext, job: Job) {
    match job {
        Job::Provision(job) => match ctx.registry.provision(ctx.store.as_ref(), &job).await {
            Some(id) => {
                ctx.snapshots.set_store_id(&job.machine_id, &id);
            }
            None => ctx.health.outbound_failed(),
        },
        Job::PersistAlert(record) => {
            if let Err(e) = ctx.store.insert_alert(&record).await {
                ctx.health.outbound_failed();
                warn!(
                    machine_id = %record.machine_id,
                    alert = %record.alert_type,
                    "alert not persisted: {e}"
                );
            }
        }
        Job::TelemetryBatch(records) => {
            if let Err(e) = ctx.store.batch_insert_telemetry(&records).await {
                ctx.health.outbound_failed();
                warn!(count = records.len(), "telemetry batch not persisted: {e}");
            }
        }
        Job::Notify(job) => notify_owner(ctx, job).await,
    }
}

async fn notify_owner(ctx: &OutboundContext, job: NotifyJob) {
    let Some(contact) = ctx.contacts.lookup(&job.machine_id, ctx.store.as_ref()).await else {
        debug!(machine_id = %job.machine_id, "no owner contact, notification skipped");
        return;
    };

    let title = format!("AgriTrack {} alert", job.alert.severity.as_str());
    let data = json!({
        "machine_id": job.machine_id,
        "type": job.alert.alert_type,
        "severity": job.alert.severity,
        "data": job.alert.data,
    });

    if job.push {
        for token in &contact.push_tokens {
            if let Err(e) = ctx.gateway.send_push(token, &title, &job.alert.message, &data).await {
                ctx.health.outbound_failed();
                warn!(machine_id = %job.machine_id, "push failed: {e}");
            }
        }
    }

    if job.sms {
        if let Some(phone) = &contact.phone {
            let text = format!("{}: {}", title, job.alert.message);
            if let Err(e) = ctx.gateway.send_sms(phone, &text).await {
                ctx.health.outbound_failed();
                warn!(machine_id = %job.machine_id, "sms failed: {e}");
            }
        }
    }
}

/// Accumulates telemetry records and hands them to the queue in batches.
pub struct TelemetryBatcher {
    batch_size: usize,
    pending: Mutex<Vec<TelemetryRecord>>,
    queue: Arc<OutboundQueue>,
}

impl TelemetryBatcher {
    pub fn new(batch_size: usize, queue: Arc<OutboundQueue>) -> Self {
        Self { batch_size, pending: Mutex::new(Vec::with_capacity(batch_size)), queue }
    }

    pub fn push(&self, record: TelemetryRecord) {
        let full = {
            let mut pending = self.pending.lock();
            pending.push(record);
            if pending.len() >= self.batch_size {
                Some(std::mem::take(&mut *pending))
            } else {
                None
            }
        };
        if let Some(batch) = full {
            self.queue.push(Job::TelemetryBatch(batch));
        }
    }

    /// Returns the number of records handed over.
    pub fn flush(&self) -> usize {
        let batch = std::mem::take(&mut *self.pending.lock());
        let count = batch.len();
        if count > 0 {
            self.queue.push(Job::TelemetryBatch(batch));
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn spawn_flusher(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let batcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let flushed = batcher.flush();
                if flushed > 0 {
                    debug!(flushed, "telemetry flushed on interval");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{AlertType, OperationalState, SensorReading, Severity, Vibration};
    use crate::notify::{LogGateway, OwnerContact};
    use crate::store::{InMemoryStore, MachineFields};
    use time::OffsetDateTime;

    fn record(machine: &str) -> TelemetryRecord {
        let reading = SensorReading {
            machine_id: machine.into(),
            temperature: 60.0,
            vibration: Vibration::new(0.1, 0.0, 0.0),
            position: None,
            speed: None,
            fuel_level: Some(70.0),
            engine_hours: None,
            timestamp: OffsetDateTime::UNIX_EPOCH,
        };
        TelemetryRecord::from_reading(&reading, OperationalState::Active)
    }

    fn alert_record(machine: &str) -> AlertRecord {
        let alert = CandidateAlert::new(AlertType::Overheat, Severity::Critical, "hot", json!({}));
        AlertRecord::from_candidate(machine, &alert, OffsetDateTime::UNIX_EPOCH)
    }

    fn context(store: Arc<InMemoryStore>) -> OutboundContext {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        OutboundContext {
            store,
            gateway: Arc::new(LogGateway),
            contacts: Arc::new(ContactDirectory::new(Duration::from_secs(60))),
            registry: Arc::new(MachineRegistry::new(clock)),
            snapshots: Arc::new(MachineStateStore::new()),
            health: HealthTracker::new(),
        }
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let health = HealthTracker::new();
        let queue = OutboundQueue::new(2, health.clone());
        queue.push(Job::PersistAlert(alert_record("a")));
        queue.push(Job::PersistAlert(alert_record("b")));
        queue.push(Job::PersistAlert(alert_record("c")));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(health.get_health(0, 0).outbound_dropped, 1);
        match queue.try_pop() {
            Some(Job::PersistAlert(r)) => assert_eq!(r.machine_id, "b"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_closed_queue_refuses_jobs() {
        let queue = OutboundQueue::new(4, HealthTracker::new());
        queue.close();
        assert!(!queue.push(Job::TelemetryBatch(vec![])));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_workers_drain_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(OutboundQueue::new(64, HealthTracker::new()));
        let workers = queue.spawn_workers(2, context(store.clone()));

        for i in 0..10 {
            queue.push(Job::PersistAlert(alert_record(&format!("m{i}"))));
        }
        let report = queue.shutdown(workers, Duration::from_secs(5)).await;

        assert!(report.drained);
        assert_eq!(report.leftover, 0);
        assert_eq!(store.alerts().len(), 10);
    }

    #[tokio::test]
    async fn test_failed_persistence_is_counted_not_retried() {
        let store = Arc::new(InMemoryStore::new());
        store.set_available(false);
        let ctx = context(store.clone());
        execute(&ctx, Job::PersistAlert(alert_record("m"))).await;

        store.set_available(true);
        assert!(store.alerts().is_empty());
        assert_eq!(ctx.health.get_health(0, 0).outbound_failed, 1);
    }

    #[tokio::test]
    async fn test_notify_without_contact_is_skipped() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = context(store.clone());
        let job = NotifyJob {
            machine_id: "m".into(),
            alert: CandidateAlert::new(AlertType::Overheat, Severity::Critical, "hot", json!({})),
            push: true,
            sms: true,
        };
        execute(&ctx, Job::Notify(job.clone())).await;
        assert_eq!(ctx.health.get_health(0, 0).outbound_failed, 0);

        let contact = OwnerContact {
            owner_name: "o".into(),
            push_tokens: vec!["t".into()],
            phone: None,
        };
        store.set_contact("m", contact);
        ctx.contacts.invalidate("m");
        execute(&ctx, Job::Notify(job)).await;
        assert_eq!(ctx.health.get_health(0, 0).outbound_failed, 0);
    }

    #[tokio::test]
    async fn test_provision_job_fills_registry() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = context(store.clone());
        let job = ProvisionJob {
            machine_id: "m".into(),
            fields: MachineFields { name: "Machine m".into(), status: OperationalState::Idle },
        };

        store.set_available(false);
        execute(&ctx, Job::Provision(job.clone())).await;
        assert_eq!(ctx.registry.store_id("m"), None);
        assert_eq!(ctx.health.get_health(0, 0).outbound_failed, 1);

        store.set_available(true);
        execute(&ctx, Job::Provision(job)).await;
        assert!(ctx.registry.store_id("m").is_some());
        assert_eq!(store.machine_count(), 1);
    }

    #[test]
    fn test_batcher_flushes_on_size() {
        let queue = Arc::new(OutboundQueue::new(16, HealthTracker::new()));
        let batcher = TelemetryBatcher::new(3, queue.clone());
        batcher.push(record("a"));
        batcher.push(record("b"));
        assert!(queue.is_empty());
        batcher.push(record("c"));

        assert_eq!(batcher.pending(), 0);
        match queue.try_pop() {
            Some(Job::TelemetryBatch(batch)) => assert_eq!(batch.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_batcher_manual_flush() {
        let queue = Arc::new(OutboundQueue::new(16, HealthTracker::new()));
        let batcher = TelemetryBatcher::new(50, queue.clone());
        assert_eq!(batcher.flush(), 0);
        assert!(queue.is_empty());
        batcher.push(record("a"));
        assert_eq!(batcher.flush(), 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batcher_flushes_on_interval() {
        let queue = Arc::new(OutboundQueue::new(16, HealthTracker::new()));
        let batcher = Arc::new(TelemetryBatcher::new(50, queue.clone()));
        let flusher = batcher.spawn_flusher(Duration::from_secs(5));
        batcher.push(record("a"));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.len(), 1);
        flusher.abort();
    }
}
