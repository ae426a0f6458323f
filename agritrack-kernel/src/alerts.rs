/**
 * ALERT DISPATCHER - Cooldown gate between detectors and side effects
 *
 * ROLE :
 * Every candidate alert passes through here. One alert per
 * (machine, alert type) is accepted per cooldown window; accepted alerts are
 * queued for persistence and, depending on the type's channel policy, for
 * owner notification.
 *
 * RULES :
 * - check and record happen under the same lock
 * - unknown types get the default cooldown and push-only policy
 * - SMS is only ever sent when `alerts.sms_enabled` is set
 */

use crate::clock::Clock;
use crate::config::{AlertConf, ChannelPolicy};
use crate::health::HealthTracker;
use crate::models::{AlertRecord, AlertType, CandidateAlert, Severity};
use crate::outbound::{Job, NotifyJob, OutboundQueue};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

const DEFAULT_COOLDOWNS: &[(&str, i64)] = &[
    ("overheat", 300),
    ("vibration", 600),
    ("geofence", 900),
    ("fuel_low", 1800),
    ("fuel_critical", 600),
    ("maintenance", 86_400),
];

const PUSH_AND_SMS: &[&str] = &["overheat", "fuel_critical", "fuel_anomaly"];

/// Alert published by another service on the external alert topic.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalAlert {
    pub machine_id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    #[serde(default = "default_external_severity")]
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

fn default_external_severity() -> Severity {
    Severity::Warning
}

impl ExternalAlert {
    pub fn into_candidate(self) -> (String, CandidateAlert) {
        (
            self.machine_id,
            CandidateAlert::new(self.alert_type, self.severity, self.message, self.data),
        )
    }
}

type CooldownKey = (String, AlertType);

pub struct AlertDispatcher {
    cooldowns: HashMap<String, Duration>,
    default_cooldown: Duration,
    policies: HashMap<String, ChannelPolicy>,
    sms_enabled: bool,
    last_sent: Mutex<HashMap<CooldownKey, OffsetDateTime>>,
    queue: Arc<OutboundQueue>,
    clock: Arc<dyn Clock>,
    health: HealthTracker,
}

/// Saturates instead of wrapping; the config loader rejects such values.
fn cooldown_window(secs: u64) -> Duration {
    Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

impl AlertDispatcher {
    pub fn new(
        conf: &AlertConf,
        queue: Arc<OutboundQueue>,
        clock: Arc<dyn Clock>,
        health: HealthTracker,
    ) -> Self {
        let mut cooldowns: HashMap<String, Duration> = DEFAULT_COOLDOWNS
            .iter()
            .map(|(class, secs)| (class.to_string(), Duration::seconds(*secs)))
            .collect();
        for (class, secs) in &conf.cooldowns {
            cooldowns.insert(class.clone(), cooldown_window(*secs));
        }

        let mut policies: HashMap<String, ChannelPolicy> = PUSH_AND_SMS
            .iter()
            .map(|class| (class.to_string(), ChannelPolicy { push: true, sms: true }))
            .collect();
        policies.extend(conf.policies.iter().map(|(k, v)| (k.clone(), *v)));

        Self {
            cooldowns,
            default_cooldown: cooldown_window(conf.default_cooldown_secs),
            policies,
            sms_enabled: conf.sms_enabled,
            last_sent: Mutex::new(HashMap::new()),
            queue,
            clock,
            health,
        }
    }

    pub fn cooldown_for(&self, alert_type: &AlertType) -> Duration {
        self.cooldowns
            .get(alert_type.policy_class())
            .copied()
            .unwrap_or(self.default_cooldown)
    }

    /// Effective channels, SMS gate applied.
    pub fn policy_for(&self, alert_type: &AlertType) -> ChannelPolicy {
        let policy = self
            .policies
            .get(alert_type.policy_class())
            .copied()
            .unwrap_or(ChannelPolicy { push: true, sms: false });
        ChannelPolicy { push: policy.push, sms: policy.sms && self.sms_enabled }
    }

    fn expired(&self, alert_type: &AlertType, last: OffsetDateTime, now: OffsetDateTime) -> bool {
        now - last >= self.cooldown_for(alert_type)
    }

    pub fn should_send(
        &self,
        machine_id: &str,
        alert_type: &AlertType,
        now: OffsetDateTime,
    ) -> bool {
        let key = (machine_id.to_string(), alert_type.clone());
        match self.last_sent.lock().get(&key) {
            Some(last) => self.expired(alert_type, *last, now),
            None => true,
        }
    }

    /// Applies the cooldown to each alert and queues side effects for the
    /// accepted ones, which are returned.
    pub fn dispatch(&self, machine_id: &str, alerts: &[CandidateAlert]) -> Vec<CandidateAlert> {
        let now = self.clock.now();
        let mut accepted = Vec::new();

        for alert in alerts {
            let admitted = {
                let mut last_sent = self.last_sent.lock();
                let key = (machine_id.to_string(), alert.alert_type.clone());
                let open = match last_sent.get(&key) {
                    Some(last) => self.expired(&alert.alert_type, *last, now),
                    None => true,
                };
                if open {
                    last_sent.insert(key, now);
                }
                open
            };

            if !admitted {
                self.health.alert_suppressed();
                debug!(
                    machine_id = %machine_id,
                    alert = %alert.alert_type,
                    "alert suppressed by cooldown"
                );
                continue;
            }

            self.health.alert_accepted();
            info!(
                machine_id = %machine_id,
                alert = %alert.alert_type,
                severity = alert.severity.as_str(),
                "alert accepted"
            );

            self.queue
                .push(Job::PersistAlert(AlertRecord::from_candidate(machine_id, alert, now)));
            let policy = self.policy_for(&alert.alert_type);
            if policy.push || policy.sms {
                self.queue.push(Job::Notify(NotifyJob {
                    machine_id: machine_id.to_string(),
                    alert: alert.clone(),
                    push: policy.push,
                    sms: policy.sms,
                }));
            }
            accepted.push(alert.clone());
        }

        accepted
    }

    /// Removes entries whose cooldown has elapsed. Returns how many went.
    pub fn sweep_expired(&self, now: OffsetDateTime) -> usize {
        let mut last_sent = self.last_sent.lock();
        let before = last_sent.len();
        last_sent.retain(|(_, alert_type), last| !self.expired(alert_type, *last, now));
        before - last_sent.len()
    }

    pub fn tracked(&self) -> usize {
        self.last_sent.lock().len()
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    struct Fixture {
        clock: Arc<ManualClock>,
        queue: Arc<OutboundQueue>,
        dispatcher: AlertDispatcher,
    }

    fn fixture(conf: AlertConf) -> Fixture {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let queue = Arc::new(OutboundQueue::new(256, HealthTracker::new()));
        let dispatcher =
            AlertDispatcher::new(&conf, queue.clone(), clock.clone(), HealthTracker::new());
        Fixture { clock, queue, dispatcher }
    }

    fn overheat() -> CandidateAlert {
        let data = json!({ "temperature": 95.0 });
        CandidateAlert::new(AlertType::Overheat, Severity::Critical, "hot", data)
    }

    #[test]
    fn test_duplicate_within_cooldown_is_suppressed() {
        let f = fixture(AlertConf::default());
        assert_eq!(f.dispatcher.dispatch("sim_001", &[overheat()]).len(), 1);
        assert!(f.dispatcher.dispatch("sim_001", &[overheat()]).is_empty());
        // other machines have their own window
        assert_eq!(f.dispatcher.dispatch("sim_002", &[overheat()]).len(), 1);
    }

    #[test]
    fn test_cooldown_boundary() {
        let f = fixture(AlertConf::default());
        f.dispatcher.dispatch("sim_001", &[overheat()]);

        f.clock.advance(Duration::seconds(299));
        assert!(f.dispatcher.dispatch("sim_001", &[overheat()]).is_empty());

        f.clock.advance(Duration::seconds(2));
        assert_eq!(f.dispatcher.dispatch("sim_001", &[overheat()]).len(), 1);
    }

    #[test]
    fn test_should_send_does_not_record() {
        let f = fixture(AlertConf::default());
        let now = f.clock.now();
        assert!(f.dispatcher.should_send("sim_001", &AlertType::Overheat, now));
        assert!(f.dispatcher.should_send("sim_001", &AlertType::Overheat, now));
        assert_eq!(f.dispatcher.tracked(), 0);
    }

    #[test]
    fn test_default_cooldowns_per_class() {
        let f = fixture(AlertConf::default());
        let d = &f.dispatcher;
        assert_eq!(d.cooldown_for(&AlertType::Vibration), Duration::minutes(10));
        assert_eq!(d.cooldown_for(&AlertType::GeofenceEntry), Duration::minutes(15));
        assert_eq!(d.cooldown_for(&AlertType::GeofenceExit), Duration::minutes(15));
        assert_eq!(d.cooldown_for(&AlertType::FuelLow), Duration::minutes(30));
        assert_eq!(d.cooldown_for(&AlertType::Maintenance), Duration::hours(24));
        assert_eq!(d.cooldown_for(&AlertType::FuelAnomaly), Duration::minutes(5));
        let unclassified = AlertType::Unclassified("hydraulics".into());
        assert_eq!(d.cooldown_for(&unclassified), Duration::minutes(5));
    }

    #[test]
    fn test_config_overrides_cooldown() {
        let mut conf = AlertConf::default();
        conf.cooldowns.insert("overheat".into(), 60);
        let f = fixture(conf);
        f.dispatcher.dispatch("sim_001", &[overheat()]);
        f.clock.advance(Duration::seconds(60));
        assert_eq!(f.dispatcher.dispatch("sim_001", &[overheat()]).len(), 1);
    }

    #[test]
    fn test_oversized_cooldown_saturates() {
        let mut conf = AlertConf::default();
        conf.cooldowns.insert("overheat".into(), u64::MAX);
        let f = fixture(conf);
        assert!(f.dispatcher.cooldown_for(&AlertType::Overheat) > Duration::ZERO);

        f.dispatcher.dispatch("sim_001", &[overheat()]);
        f.clock.advance(Duration::days(3650));
        assert!(f.dispatcher.dispatch("sim_001", &[overheat()]).is_empty());
    }

    #[test]
    fn test_entry_and_exit_have_separate_windows() {
        let f = fixture(AlertConf::default());
        let entry =
            CandidateAlert::new(AlertType::GeofenceEntry, Severity::Warning, "in", json!({}));
        let exit =
            CandidateAlert::new(AlertType::GeofenceExit, Severity::Warning, "out", json!({}));
        assert_eq!(f.dispatcher.dispatch("sim_001", &[entry.clone(), exit]).len(), 2);
        assert!(f.dispatcher.dispatch("sim_001", &[entry]).is_empty());
    }

    #[test]
    fn test_sms_gate() {
        let push_only = ChannelPolicy { push: true, sms: false };
        let f = fixture(AlertConf::default());
        assert_eq!(f.dispatcher.policy_for(&AlertType::Overheat), push_only);

        let f = fixture(AlertConf { sms_enabled: true, ..Default::default() });
        let both = ChannelPolicy { push: true, sms: true };
        assert_eq!(f.dispatcher.policy_for(&AlertType::Overheat), both);
        assert_eq!(f.dispatcher.policy_for(&AlertType::Vibration), push_only);
    }

    #[test]
    fn test_accepted_alert_queues_persist_and_notify() {
        let f = fixture(AlertConf::default());
        f.dispatcher.dispatch("sim_001", &[overheat()]);
        assert_eq!(f.queue.len(), 2);
        assert!(matches!(
            f.queue.try_pop(),
            Some(Job::PersistAlert(r)) if r.machine_id == "sim_001" && !r.acknowledged
        ));
        assert!(matches!(f.queue.try_pop(), Some(Job::Notify(n)) if n.push && !n.sms));
    }

    #[test]
    fn test_policy_without_channels_only_persists() {
        let mut conf = AlertConf::default();
        conf.policies.insert("vibration".into(), ChannelPolicy { push: false, sms: false });
        let f = fixture(conf);
        let vib = CandidateAlert::new(AlertType::Vibration, Severity::Warning, "shaky", json!({}));
        f.dispatcher.dispatch("sim_001", &[vib]);
        assert_eq!(f.queue.len(), 1);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let f = fixture(AlertConf::default());
        let vib = CandidateAlert::new(AlertType::Vibration, Severity::Warning, "shaky", json!({}));
        f.dispatcher.dispatch("sim_001", &[overheat(), vib]);

        f.clock.advance(Duration::seconds(400));
        assert_eq!(f.dispatcher.sweep_expired(f.clock.now()), 1);
        assert_eq!(f.dispatcher.tracked(), 1);
        assert!(!f.dispatcher.should_send("sim_001", &AlertType::Vibration, f.clock.now()));
    }

    #[test]
    fn test_external_alert_parsing() {
        let raw = r#"{"machine_id":"sim_003","type":"maintenance","message":"Bearing wear"}"#;
        let external: ExternalAlert = serde_json::from_str(raw).unwrap();
        let (machine, alert) = external.into_candidate();
        assert_eq!(machine, "sim_003");
        assert_eq!(alert.alert_type, AlertType::Maintenance);
        assert_eq!(alert.severity, Severity::Warning);
    }
}
