/**
 * AGRITRACK KERNEL - Service entry point
 *
 * ROLE : loads config and secrets, picks the store and notification
 * backends, assembles the kernel, then runs the MQTT listener, the live
 * bridge and the HTTP API until Ctrl-C.
 */

use agritrack_kernel::clock::SystemClock;
use agritrack_kernel::config::{load_config, NotifyBackend, StoreBackend};
use agritrack_kernel::http::{build_router, AppState};
use agritrack_kernel::mqtt;
use agritrack_kernel::notify::{HttpGateway, LogGateway, NotificationGateway};
use agritrack_kernel::store::{InMemoryStore, MachineStore, SupabaseStore};
use agritrack_kernel::Kernel;
use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agritrack_kernel=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = load_config().await;

    let store: Arc<dyn MachineStore> = match cfg.store.backend {
        StoreBackend::Supabase => {
            Arc::new(SupabaseStore::new(&cfg.store).context("supabase store")?)
        }
        StoreBackend::Memory => {
            warn!("no remote store configured, running in-memory");
            Arc::new(InMemoryStore::new())
        }
    };

    let gateway: Arc<dyn NotificationGateway> = match cfg.notify.backend {
        NotifyBackend::Http => {
            Arc::new(HttpGateway::new(&cfg.notify).context("notification gateway")?)
        }
        NotifyBackend::Log => Arc::new(LogGateway),
    };

    let kernel = Arc::new(Kernel::new(cfg.clone(), store, gateway, Arc::new(SystemClock)));
    let tasks = kernel.start();

    let listener_task = mqtt::spawn_supervised_listener(
        cfg.mqtt.clone(),
        tasks.pool.clone(),
        kernel.ingestor.clone(),
        kernel.health.clone(),
    );
    let (bridge_task, bridge_poller) =
        mqtt::spawn_live_bridge(&cfg.mqtt, kernel.hub.clone(), kernel.snapshots.clone());

    let app = build_router(AppState::new(kernel.clone(), std::env::var("AGRITRACK_API_KEY").ok()));
    let listener = TcpListener::bind(cfg.http.bind.as_str())
        .await
        .with_context(|| format!("binding {}", cfg.http.bind))?;
    info!(addr = %cfg.http.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("http server")?;

    listener_task.abort();
    bridge_task.abort();
    bridge_poller.abort();
    let report = kernel.shutdown(tasks).await;
    if !report.drained {
        warn!(leftover = report.leftover, "outbound jobs lost at shutdown");
    }
    Ok(())
}
