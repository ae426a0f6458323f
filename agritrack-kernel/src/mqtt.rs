/**
 * MQTT TRANSPORT - Inbound telemetry and outbound live snapshots
 *
 * INBOUND :
 * - `telemetry_topic` : raw sensor payloads, routed to the worker pool
 * - `alert_topic` : alerts raised by other services (AI engine...)
 * Subscriptions are (re)issued on every ConnAck. A rejected subscription
 * ends the listener with an error and the supervisor restarts it with
 * back-off.
 *
 * OUTBOUND :
 * The live bridge publishes every snapshot retained on
 * `<live_prefix>/<machine_id>`, so a new MQTT subscriber receives the whole
 * fleet immediately. It uses its own client.
 */

use crate::config::MqttConf;
use crate::health::HealthTracker;
use crate::models::MachineSnapshot;
use crate::snapshots::{MachineStateStore, SnapshotHub};
use crate::telemetry::TelemetryIngestor;
use crate::workers::{SubmitError, WorkerPool};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS, SubscribeReasonCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const POLL_ERROR_PAUSE: Duration = Duration::from_secs(2);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Subscription rejected by broker")]
    SubscriptionRejected,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Publishing side of an MQTT client.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

#[async_trait]
impl MessagePublisher for AsyncClient {
    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.publish(topic, QoS::AtLeastOnce, true, payload).await?;
        Ok(())
    }
}

pub fn create_mqtt_client(conf: &MqttConf, client_suffix: &str) -> (AsyncClient, EventLoop) {
    let client_id = if client_suffix.is_empty() {
        conf.client_id.clone()
    } else {
        format!("{}-{}", conf.client_id, client_suffix)
    };
    let mut opts = MqttOptions::new(client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs));
    AsyncClient::new(opts, 64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Telemetry,
    ExternalAlert,
    Unknown,
}

pub fn classify(topic: &str, conf: &MqttConf) -> InboundKind {
    if topic == conf.telemetry_topic {
        InboundKind::Telemetry
    } else if topic == conf.alert_topic {
        InboundKind::ExternalAlert
    } else {
        InboundKind::Unknown
    }
}

/// Hands one inbound message to the right consumer. Never waits on a
/// shard: the event loop must keep polling to hold the connection.
pub fn handle_message(
    topic: &str,
    payload: &[u8],
    conf: &MqttConf,
    pool: &WorkerPool,
    ingestor: &TelemetryIngestor,
    health: &HealthTracker,
) {
    match classify(topic, conf) {
        InboundKind::Telemetry => match pool.try_submit(payload.to_vec()) {
            Ok(()) => {}
            Err(SubmitError::Full(_)) => health.reading_dropped(),
            Err(e) => warn!(%topic, "telemetry not queued: {e}"),
        },
        InboundKind::ExternalAlert => {
            if let Ok(accepted) = ingestor.process_external_alert(payload) {
                debug!(accepted = accepted.len(), "external alert handled");
            }
        }
        InboundKind::Unknown => debug!(%topic, "message on unexpected topic ignored"),
    }
}

async fn run_listener(
    conf: &MqttConf,
    pool: &WorkerPool,
    ingestor: &TelemetryIngestor,
    health: &HealthTracker,
) -> Result<(), TransportError> {
    let (client, mut eventloop) = create_mqtt_client(conf, "");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                health.mark_mqtt_connected();
                client.subscribe(&conf.telemetry_topic, QoS::AtLeastOnce).await?;
                client.subscribe(&conf.alert_topic, QoS::AtLeastOnce).await?;
                info!(
                    host = %conf.host,
                    port = conf.port,
                    topic = %conf.telemetry_topic,
                    "mqtt connected, subscribing"
                );
            }
            Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if rejected {
                    health.mark_mqtt_disconnected();
                    return Err(TransportError::SubscriptionRejected);
                }
            }
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                handle_message(&p.topic, &p.payload, conf, pool, ingestor, health);
            }
            Ok(_) => {}
            Err(e) => {
                // rumqttc reconnects on the next poll
                warn!("mqtt connection error: {e}");
                health.increment_reconnects();
                tokio::time::sleep(POLL_ERROR_PAUSE).await;
            }
        }
    }
}

pub fn restart_backoff(restarts: u32) -> Duration {
    let secs = 1u64 << restarts.min(5);
    Duration::from_secs(secs).min(MAX_RESTART_BACKOFF)
}

/// Runs the inbound listener forever, restarting it when it fails.
pub fn spawn_supervised_listener(
    conf: MqttConf,
    pool: Arc<WorkerPool>,
    ingestor: Arc<TelemetryIngestor>,
    health: HealthTracker,
) -> JoinHandle<()> {
    task::spawn(async move {
        let mut restarts = 0u32;
        loop {
            if let Err(e) = run_listener(&conf, &pool, &ingestor, &health).await {
                let pause = restart_backoff(restarts);
                error!("mqtt listener stopped: {e}, restarting in {}s", pause.as_secs());
                health.increment_listener_restarts();
                restarts = restarts.saturating_add(1);
                tokio::time::sleep(pause).await;
            }
        }
    })
}

pub fn live_topic(prefix: &str, machine_id: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), machine_id)
}

pub async fn publish_snapshot(
    publisher: &dyn MessagePublisher,
    prefix: &str,
    snapshot: &MachineSnapshot,
) -> Result<(), TransportError> {
    let payload = serde_json::to_vec(snapshot)?;
    publisher.publish_retained(&live_topic(prefix, &snapshot.machine_id), payload).await
}

/// Publishes the current fleet, then every update, until the hub closes.
pub async fn run_live_bridge(
    publisher: Arc<dyn MessagePublisher>,
    prefix: String,
    hub: Arc<SnapshotHub>,
    store: Arc<MachineStateStore>,
) {
    let (initial, mut updates) = hub.subscribe(&store);
    for snapshot in &initial {
        if let Err(e) = publish_snapshot(publisher.as_ref(), &prefix, snapshot).await {
            warn!(machine_id = %snapshot.machine_id, "live publish failed: {e}");
        }
    }

    loop {
        match updates.recv().await {
            Ok(snapshot) => {
                if let Err(e) = publish_snapshot(publisher.as_ref(), &prefix, &snapshot).await {
                    warn!(machine_id = %snapshot.machine_id, "live publish failed: {e}");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "live bridge lagging, snapshots skipped")
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Live bridge over a dedicated MQTT client; its event loop is polled here.
pub fn spawn_live_bridge(
    conf: &MqttConf,
    hub: Arc<SnapshotHub>,
    store: Arc<MachineStateStore>,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let (client, mut eventloop) = create_mqtt_client(conf, "live");
    let prefix = conf.live_prefix.clone();
    let bridge = task::spawn(run_live_bridge(Arc::new(client), prefix, hub, store));
    let poller = task::spawn(async move {
        loop {
            if let Err(e) = eventloop.poll().await {
                debug!("live bridge mqtt error: {e}");
                tokio::time::sleep(POLL_ERROR_PAUSE).await;
            }
        }
    });
    (bridge, poller)
}
