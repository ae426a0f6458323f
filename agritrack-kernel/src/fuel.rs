//! Fuel analytics: bounded per-machine history, level alerts, anomaly
//! detection and consumption reports.

use crate::config::FuelConf;
use crate::models::{AlertType, CandidateAlert, Severity};
use crate::store::MachineStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use time::{Duration, OffsetDateTime};
use tracing::warn;

const SECONDS_PER_DAY: f64 = 86_400.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FuelSample {
    pub level: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuelUpdate {
    /// max(previous - current, 0); 0 for the first sample
    pub consumption_delta: f64,
    pub alerts: Vec<CandidateAlert>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RefillEvent {
    pub added: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowReport {
    pub consumed: f64,
    pub refills: Vec<RefillEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySource {
    Buffer,
    Store,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumptionReport {
    pub machine_id: String,
    pub window_hours: f64,
    pub samples: usize,
    pub consumed: f64,
    pub refills: Vec<RefillEvent>,
    pub current_level: Option<f64>,
    pub average_daily: Option<f64>,
    /// None when consumption is zero or the window has no span
    pub days_remaining: Option<f64>,
    pub source: HistorySource,
}

pub struct FuelAnalyticsEngine {
    conf: FuelConf,
    history: Mutex<HashMap<String, VecDeque<FuelSample>>>,
}

impl FuelAnalyticsEngine {
    pub fn new(conf: &FuelConf) -> Self {
        Self { conf: conf.clone(), history: Mutex::new(HashMap::new()) }
    }

    pub fn record_reading(
        &self,
        machine_id: &str,
        level: f64,
        timestamp: OffsetDateTime,
    ) -> FuelUpdate {
        let previous = {
            let mut history = self.history.lock();
            let buffer = history.entry(machine_id.to_string()).or_default();
            let previous = buffer.back().map(|s| s.level);
            if buffer.len() == self.conf.history_capacity {
                buffer.pop_front();
            }
            buffer.push_back(FuelSample { level, timestamp });
            previous
        };

        let mut alerts = Vec::new();
        if level < self.conf.critical_level {
            alerts.push(CandidateAlert::new(
                AlertType::FuelCritical,
                Severity::Critical,
                format!("Fuel critically low: {level:.1}%"),
                json!({ "fuel_level": level, "threshold": self.conf.critical_level }),
            ));
        } else if level < self.conf.low_level {
            alerts.push(CandidateAlert::new(
                AlertType::FuelLow,
                Severity::Warning,
                format!("Fuel low: {level:.1}%"),
                json!({ "fuel_level": level, "threshold": self.conf.low_level }),
            ));
        }

        let drop = previous.map(|p| p - level).unwrap_or(0.0);
        if drop > self.conf.anomaly_drop {
            alerts.push(CandidateAlert::new(
                AlertType::FuelAnomaly,
                Severity::Critical,
                format!("Fuel dropped {drop:.1}% in one interval, possible leak or theft"),
                json!({ "previous": previous, "current": level, "drop": drop }),
            ));
        }

        FuelUpdate { consumption_delta: drop.max(0.0), alerts }
    }

    pub fn history(&self, machine_id: &str) -> Vec<FuelSample> {
        self.history
            .lock()
            .get(machine_id)
            .map(|b| b.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Consumption is the sum of decreases; increases above the refill
    /// threshold are reported as refills.
    pub fn window_report(&self, samples: &[FuelSample]) -> WindowReport {
        let mut consumed = 0.0;
        let mut refills = Vec::new();
        for pair in samples.windows(2) {
            let delta = pair[1].level - pair[0].level;
            if delta < 0.0 {
                consumed += -delta;
            } else if delta > self.conf.refill_threshold {
                refills.push(RefillEvent { added: delta, timestamp: pair[1].timestamp });
            }
        }
        WindowReport { consumed, refills }
    }

    pub async fn consumption_report(
        &self,
        machine_id: &str,
        window: Duration,
        now: OffsetDateTime,
        store: &dyn MachineStore,
    ) -> ConsumptionReport {
        let start = now - window;
        let buffer = self.history(machine_id);
        let covered = buffer.first().map(|s| s.timestamp <= start).unwrap_or(false);

        let (samples, source) = if covered {
            let recent: Vec<_> = buffer.into_iter().filter(|s| s.timestamp >= start).collect();
            (recent, HistorySource::Buffer)
        } else {
            match store.fuel_history(machine_id, start).await {
                Ok(durable) if !durable.is_empty() => (durable, HistorySource::Store),
                Ok(_) => (buffer, HistorySource::Buffer),
                Err(e) => {
                    warn!(machine_id = %machine_id, "fuel history unavailable, using buffer: {e}");
                    (buffer, HistorySource::Buffer)
                }
            }
        };

        let WindowReport { consumed, refills } = self.window_report(&samples);
        let span_days = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => {
                (last.timestamp - first.timestamp).as_seconds_f64() / SECONDS_PER_DAY
            }
            _ => 0.0,
        };
        let average_daily = (span_days > 0.0).then(|| consumed / span_days);
        let current_level = samples.last().map(|s| s.level);
        let days_remaining = match (current_level, average_daily) {
            (Some(level), Some(avg)) if avg > 0.0 => Some(level / avg),
            _ => None,
        };

        ConsumptionReport {
            machine_id: machine_id.to_string(),
            window_hours: window.as_seconds_f64() / 3600.0,
            samples: samples.len(),
            consumed,
            refills,
            current_level,
            average_daily,
            days_remaining,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn at(minutes: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::minutes(minutes)
    }

    fn engine() -> FuelAnalyticsEngine {
        FuelAnalyticsEngine::new(&FuelConf::default())
    }

    fn types(update: &FuelUpdate) -> Vec<AlertType> {
        update.alerts.iter().map(|a| a.alert_type.clone()).collect()
    }

    #[test]
    fn test_anomaly_fires_once_on_large_drop() {
        let engine = engine();
        let a = engine.record_reading("m", 80.0, at(0));
        let b = engine.record_reading("m", 82.0, at(1));
        let c = engine.record_reading("m", 50.0, at(2));

        assert!(a.alerts.is_empty());
        assert!(b.alerts.is_empty());
        assert_eq!(b.consumption_delta, 0.0);
        assert_eq!(types(&c), vec![AlertType::FuelAnomaly]);
        assert_eq!(c.consumption_delta, 32.0);
    }

    #[test]
    fn test_drop_of_exactly_threshold_is_normal() {
        let engine = engine();
        engine.record_reading("m", 70.0, at(0));
        assert!(engine.record_reading("m", 50.0, at(1)).alerts.is_empty());
    }

    #[test]
    fn test_critical_supersedes_low() {
        let engine = engine();
        assert_eq!(types(&engine.record_reading("m", 14.9, at(0))), vec![AlertType::FuelLow]);
        assert_eq!(types(&engine.record_reading("m", 4.0, at(1))), vec![AlertType::FuelCritical]);
        assert!(engine.record_reading("m", 15.0, at(2)).alerts.is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let engine =
            FuelAnalyticsEngine::new(&FuelConf { history_capacity: 3, ..Default::default() });
        for i in 0..5 {
            engine.record_reading("m", 90.0 - i as f64, at(i));
        }
        let history = engine.history("m");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].level, 88.0);
    }

    #[test]
    fn test_window_report_splits_refills() {
        let engine = engine();
        let samples: Vec<FuelSample> = [60.0, 55.0, 50.0, 52.0, 90.0, 85.0]
            .iter()
            .enumerate()
            .map(|(i, &level)| FuelSample { level, timestamp: at(i as i64) })
            .collect();
        let report = engine.window_report(&samples);
        assert_eq!(report.consumed, 15.0);
        assert_eq!(report.refills.len(), 1);
        assert_eq!(report.refills[0].added, 38.0);
    }

    #[tokio::test]
    async fn test_report_from_buffer() {
        let engine = engine();
        let store = InMemoryStore::new();
        // 48 samples over 2 days, 1% per hour
        for h in 0..=48 {
            engine.record_reading("m", 90.0 - h as f64, at(h * 60));
        }
        let now = at(48 * 60);
        let report = engine.consumption_report("m", Duration::hours(24), now, &store).await;

        assert_eq!(report.source, HistorySource::Buffer);
        assert_eq!(report.samples, 25);
        assert!((report.consumed - 24.0).abs() < 1e-9);
        assert!((report.average_daily.unwrap() - 24.0).abs() < 1e-9);
        assert!((report.days_remaining.unwrap() - 42.0 / 24.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_report_falls_back_to_store_then_buffer() {
        let engine = engine();
        let store = InMemoryStore::new();
        engine.record_reading("m", 50.0, at(600));
        engine.record_reading("m", 48.0, at(660));

        store.push_fuel_history("m", FuelSample { level: 60.0, timestamp: at(0) });
        store.push_fuel_history("m", FuelSample { level: 48.0, timestamp: at(660) });
        let report = engine.consumption_report("m", Duration::hours(24), at(660), &store).await;
        assert_eq!(report.source, HistorySource::Store);
        assert_eq!(report.consumed, 12.0);

        store.set_available(false);
        let report = engine.consumption_report("m", Duration::hours(24), at(660), &store).await;
        assert_eq!(report.source, HistorySource::Buffer);
        assert_eq!(report.consumed, 2.0);
    }

    #[tokio::test]
    async fn test_no_consumption_means_unknown_days() {
        let engine = engine();
        let store = InMemoryStore::new();
        engine.record_reading("m", 50.0, at(0));
        engine.record_reading("m", 50.0, at(60));
        let report = engine.consumption_report("m", Duration::minutes(30), at(60), &store).await;
        assert_eq!(report.days_remaining, None);
    }
}
