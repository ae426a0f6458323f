use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub machines_tracked: u32,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    pub listener_restarts: u32,
    pub readings_processed: u64,
    pub readings_rejected: u64,
    pub readings_dropped: u64,
    pub alerts_accepted: u64,
    pub alerts_suppressed: u64,
    pub outbound_dropped: u64,
    pub outbound_failed: u64,
    pub outbound_pending: usize,
}

#[derive(Default)]
struct Counters {
    readings_processed: AtomicU64,
    readings_rejected: AtomicU64,
    readings_dropped: AtomicU64,
    alerts_accepted: AtomicU64,
    alerts_suppressed: AtomicU64,
    outbound_dropped: AtomicU64,
    outbound_failed: AtomicU64,
    mqtt_reconnects: AtomicU32,
    listener_restarts: AtomicU32,
}

/// Process-wide counters and transport status. Cheap to clone.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    counters: Arc<Counters>,
    mqtt_status: Arc<parking_lot::Mutex<String>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
            mqtt_status: Arc::new(parking_lot::Mutex::new("connecting".to_string())),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.counters.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn increment_listener_restarts(&self) {
        self.counters.listener_restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reading_processed(&self) {
        self.counters.readings_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reading_rejected(&self) {
        self.counters.readings_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Reading refused at intake because its shard was full.
    pub fn reading_dropped(&self) {
        self.counters.readings_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alert_accepted(&self) {
        self.counters.alerts_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn alert_suppressed(&self) {
        self.counters.alerts_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outbound_dropped(&self) {
        self.counters.outbound_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outbound_failed(&self) {
        self.counters.outbound_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub fn get_health(&self, machines_tracked: usize, outbound_pending: usize) -> KernelHealth {
        let c = &self.counters;
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            machines_tracked: machines_tracked as u32,
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: c.mqtt_reconnects.load(Ordering::Relaxed),
            listener_restarts: c.listener_restarts.load(Ordering::Relaxed),
            readings_processed: c.readings_processed.load(Ordering::Relaxed),
            readings_rejected: c.readings_rejected.load(Ordering::Relaxed),
            readings_dropped: c.readings_dropped.load(Ordering::Relaxed),
            alerts_accepted: c.alerts_accepted.load(Ordering::Relaxed),
            alerts_suppressed: c.alerts_suppressed.load(Ordering::Relaxed),
            outbound_dropped: c.outbound_dropped.load(Ordering::Relaxed),
            outbound_failed: c.outbound_failed.load(Ordering::Relaxed),
            outbound_pending,
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }

    0.0
}
