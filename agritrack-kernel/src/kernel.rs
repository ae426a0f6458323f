/**
 * KERNEL - Assembly of every component
 *
 * ROLE :
 * Builds the caches, engines and queues from a `KernelConfig` and the three
 * injected collaborators (store, notification gateway, clock). Nothing is a
 * global: the binary, the HTTP layer and the test harness all hold the same
 * `Kernel` value.
 *
 * LIFECYCLE :
 * `start()` spawns outbound workers, ingest shards, the batch flusher and
 * the maintenance loops. `shutdown()` stops intake, drains the shards,
 * flushes the batcher and drains the outbound queue up to the timeout.
 */

use crate::alerts::AlertDispatcher;
use crate::clock::Clock;
use crate::config::KernelConfig;
use crate::fuel::FuelAnalyticsEngine;
use crate::geofence::GeofenceEngine;
use crate::health::{HealthTracker, KernelHealth};
use crate::notify::{ContactDirectory, NotificationGateway};
use crate::outbound::{OutboundContext, OutboundQueue, ShutdownReport, TelemetryBatcher};
use crate::registry::MachineRegistry;
use crate::snapshots::{MachineStateStore, SnapshotHub};
use crate::store::MachineStore;
use crate::telemetry::{IngestorDeps, TelemetryIngestor};
use crate::workers::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const LIVE_CHANNEL_CAPACITY: usize = 256;

pub struct Kernel {
    pub config: KernelConfig,
    pub store: Arc<dyn MachineStore>,
    pub gateway: Arc<dyn NotificationGateway>,
    pub clock: Arc<dyn Clock>,
    pub health: HealthTracker,
    pub contacts: Arc<ContactDirectory>,
    pub registry: Arc<MachineRegistry>,
    pub queue: Arc<OutboundQueue>,
    pub batcher: Arc<TelemetryBatcher>,
    pub geofences: Arc<GeofenceEngine>,
    pub fuel: Arc<FuelAnalyticsEngine>,
    pub dispatcher: Arc<AlertDispatcher>,
    pub snapshots: Arc<MachineStateStore>,
    pub hub: Arc<SnapshotHub>,
    pub ingestor: Arc<TelemetryIngestor>,
}

/// Handles of the tasks spawned by `Kernel::start`.
pub struct KernelTasks {
    pub pool: Arc<WorkerPool>,
    outbound: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl Kernel {
    pub fn new(
        config: KernelConfig,
        store: Arc<dyn MachineStore>,
        gateway: Arc<dyn NotificationGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let health = HealthTracker::new();
        let contact_ttl = Duration::from_secs(config.store.contact_ttl_secs);
        let contacts = Arc::new(ContactDirectory::new(contact_ttl));
        let registry = Arc::new(MachineRegistry::new(clock.clone()));
        let queue = Arc::new(OutboundQueue::new(config.outbound.capacity, health.clone()));
        let batcher = Arc::new(TelemetryBatcher::new(config.outbound.batch_size, queue.clone()));
        let geofences = Arc::new(GeofenceEngine::new(&config.geofence));
        let fuel = Arc::new(FuelAnalyticsEngine::new(&config.fuel));
        let dispatcher = Arc::new(AlertDispatcher::new(
            &config.alerts,
            queue.clone(),
            clock.clone(),
            health.clone(),
        ));
        let snapshots = Arc::new(MachineStateStore::new());
        let hub = Arc::new(SnapshotHub::new(LIVE_CHANNEL_CAPACITY));

        let ingestor = Arc::new(TelemetryIngestor::new(
            &config.thresholds,
            IngestorDeps {
                store: store.clone(),
                clock: clock.clone(),
                health: health.clone(),
                geofences: geofences.clone(),
                fuel: fuel.clone(),
                dispatcher: dispatcher.clone(),
                snapshots: snapshots.clone(),
                hub: hub.clone(),
                batcher: batcher.clone(),
                queue: queue.clone(),
                registry: registry.clone(),
            },
        ));

        Self {
            config,
            store,
            gateway,
            clock,
            health,
            contacts,
            registry,
            queue,
            batcher,
            geofences,
            fuel,
            dispatcher,
            snapshots,
            hub,
            ingestor,
        }
    }

    pub fn outbound_context(&self) -> OutboundContext {
        OutboundContext {
            store: self.store.clone(),
            gateway: self.gateway.clone(),
            contacts: self.contacts.clone(),
            registry: self.registry.clone(),
            snapshots: self.snapshots.clone(),
            health: self.health.clone(),
        }
    }

    pub fn health_report(&self) -> KernelHealth {
        self.health.get_health(self.snapshots.len(), self.queue.len())
    }

    pub fn start(&self) -> KernelTasks {
        let outbound = self
            .queue
            .spawn_workers(self.config.outbound.workers, self.outbound_context());
        let pool = Arc::new(WorkerPool::spawn(
            self.ingestor.clone(),
            self.config.workers.shards,
            self.config.workers.queue_capacity,
        ));

        let background = vec![
            self.batcher.spawn_flusher(Duration::from_secs(
                self.config.outbound.flush_interval_secs.max(1),
            )),
            self.spawn_sweeper(),
            self.spawn_geofence_refresh(),
        ];

        info!(
            shards = pool.shard_count(),
            outbound_workers = self.config.outbound.workers,
            "kernel started"
        );
        KernelTasks { pool, outbound, background }
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let geofences = self.geofences.clone();
        let every = Duration::from_secs(self.config.alerts.sweep_interval_secs.max(1));
        let containment_ttl = self
            .config
            .geofence
            .containment_idle_ttl_secs
            .map(Duration::from_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let cooldowns = dispatcher.sweep_expired(dispatcher.now());
                let containment = containment_ttl
                    .map(|ttl| geofences.forget_idle(ttl))
                    .unwrap_or(0);
                debug!(cooldowns, containment, "maintenance sweep");
            }
        })
    }

    fn spawn_geofence_refresh(&self) -> JoinHandle<()> {
        let geofences = self.geofences.clone();
        let store = self.store.clone();
        let every = Duration::from_secs(self.config.geofence.refresh_interval_secs.max(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                // first tick fires immediately: initial load
                interval.tick().await;
                let _ = geofences.refresh_assignments(store.as_ref()).await;
            }
        })
    }

    pub async fn shutdown(&self, tasks: KernelTasks) -> ShutdownReport {
        for handle in &tasks.background {
            handle.abort();
        }
        tasks.pool.shutdown().await;
        let flushed = self.batcher.flush();
        debug!(flushed, "telemetry flushed for shutdown");

        let timeout = Duration::from_secs(self.config.outbound.shutdown_timeout_secs);
        let report = self.queue.shutdown(tasks.outbound, timeout).await;
        info!(drained = report.drained, leftover = report.leftover, "kernel stopped");
        report
    }
}
