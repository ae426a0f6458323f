use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub http: HttpConf,
    pub thresholds: ThresholdConf,
    pub fuel: FuelConf,
    pub geofence: GeofenceConf,
    pub alerts: AlertConf,
    pub workers: WorkerConf,
    pub outbound: OutboundConf,
    pub store: StoreConf,
    pub notify: NotifyConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub telemetry_topic: String,
    pub alert_topic: String,
    /// Snapshots go to `<live_prefix>/<machine_id>` (retained).
    pub live_prefix: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "agritrack-kernel".into(),
            telemetry_topic: "agritrack/live/sensors".into(),
            alert_topic: "agritrack/alerts/external".into(),
            live_prefix: "agritrack/live/machines".into(),
            keep_alive_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConf {
    pub overheat_temp: f64,
    pub vibration: f64,
    pub idle_speed: f64,
}

impl Default for ThresholdConf {
    fn default() -> Self {
        Self { overheat_temp: 90.0, vibration: 0.5, idle_speed: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuelConf {
    pub low_level: f64,
    pub critical_level: f64,
    pub anomaly_drop: f64,
    pub refill_threshold: f64,
    pub history_capacity: usize,
}

impl Default for FuelConf {
    fn default() -> Self {
        Self {
            low_level: 15.0,
            critical_level: 5.0,
            anomaly_drop: 20.0,
            refill_threshold: 10.0,
            history_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceConf {
    pub refresh_interval_secs: u64,
    /// false = the first fix after start seeds containment without entry events
    pub report_entry_on_first_fix: bool,
    /// None keeps containment entries for the process lifetime
    pub containment_idle_ttl_secs: Option<u64>,
}

impl Default for GeofenceConf {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
            report_entry_on_first_fix: true,
            containment_idle_ttl_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPolicy {
    pub push: bool,
    pub sms: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConf {
    pub default_cooldown_secs: u64,
    /// Per policy class overrides (overheat, vibration, geofence, fuel_low...)
    pub cooldowns: HashMap<String, u64>,
    pub policies: HashMap<String, ChannelPolicy>,
    /// Global cost-control gate for SMS
    pub sms_enabled: bool,
    pub sweep_interval_secs: u64,
}

impl Default for AlertConf {
    fn default() -> Self {
        Self {
            default_cooldown_secs: 300,
            cooldowns: HashMap::new(),
            policies: HashMap::new(),
            sms_enabled: false,
            sweep_interval_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConf {
    pub shards: usize,
    pub queue_capacity: usize,
}

impl Default for WorkerConf {
    fn default() -> Self {
        Self { shards: 4, queue_capacity: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConf {
    pub capacity: usize,
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for OutboundConf {
    fn default() -> Self {
        Self {
            capacity: 1024,
            workers: 2,
            batch_size: 50,
            flush_interval_secs: 5,
            shutdown_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Supabase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConf {
    pub backend: StoreBackend,
    pub url: Option<String>,
    #[serde(skip_serializing)]
    pub service_key: Option<String>,
    pub timeout_secs: u64,
    pub contact_ttl_secs: u64,
}

impl Default for StoreConf {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: None,
            service_key: None,
            timeout_secs: 5,
            contact_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyBackend {
    #[default]
    Log,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConf {
    pub backend: NotifyBackend,
    pub push_url: String,
    pub sms_url: Option<String>,
    #[serde(skip_serializing)]
    pub sms_token: Option<String>,
    pub sms_from: Option<String>,
    pub timeout_secs: u64,
}

impl Default for NotifyConf {
    fn default() -> Self {
        Self {
            backend: NotifyBackend::Log,
            push_url: "https://exp.host/--/api/v2/push/send".into(),
            sms_url: None,
            sms_token: None,
            sms_from: None,
            timeout_secs: 5,
        }
    }
}

impl KernelConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: KernelConfig = serde_yaml::from_str(txt)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let txt = fs::read_to_string(path).await?;
        Self::from_yaml_str(&txt)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.thresholds;
        if t.overheat_temp <= 0.0 || t.vibration <= 0.0 || t.idle_speed < 0.0 {
            return Err(ConfigError::Invalid("thresholds must be positive".into()));
        }
        let f = &self.fuel;
        if f.critical_level >= f.low_level {
            return Err(ConfigError::Invalid(format!(
                "fuel.critical_level ({}) must be below fuel.low_level ({})",
                f.critical_level, f.low_level
            )));
        }
        if f.history_capacity == 0 {
            return Err(ConfigError::Invalid("fuel.history_capacity must be > 0".into()));
        }
        let a = &self.alerts;
        let windows = std::iter::once(("default_cooldown_secs", a.default_cooldown_secs))
            .chain(a.cooldowns.iter().map(|(class, secs)| (class.as_str(), *secs)));
        for (name, secs) in windows {
            if i64::try_from(secs).is_err() {
                return Err(ConfigError::Invalid(format!("alerts cooldown {name} is out of range")));
            }
        }
        if self.workers.shards == 0 || self.workers.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "workers.shards and workers.queue_capacity must be > 0".into(),
            ));
        }
        let o = &self.outbound;
        if o.capacity == 0 || o.workers == 0 || o.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "outbound capacity, workers and batch_size must be > 0".into(),
            ));
        }
        if self.store.backend == StoreBackend::Supabase && self.store.url.is_none() {
            return Err(ConfigError::Invalid(
                "store.url is required for the supabase backend".into(),
            ));
        }
        Ok(())
    }

    /// Secrets and deployment endpoints come from the environment and win over the file.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("AGRITRACK_MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Ok(port) = std::env::var("AGRITRACK_MQTT_PORT") {
            match port.parse() {
                Ok(p) => self.mqtt.port = p,
                Err(_) => warn!(value = %port, "ignoring invalid AGRITRACK_MQTT_PORT"),
            }
        }
        if let Ok(url) = std::env::var("SUPABASE_URL") {
            self.store.url = Some(url);
            self.store.backend = StoreBackend::Supabase;
        }
        if let Ok(key) = std::env::var("SUPABASE_SERVICE_KEY") {
            self.store.service_key = Some(key);
        }
        if let Ok(url) = std::env::var("AGRITRACK_PUSH_URL") {
            self.notify.push_url = url;
            self.notify.backend = NotifyBackend::Http;
        }
        if let Ok(url) = std::env::var("AGRITRACK_SMS_URL") {
            self.notify.sms_url = Some(url);
        }
        if let Ok(token) = std::env::var("AGRITRACK_SMS_TOKEN") {
            self.notify.sms_token = Some(token);
        }
    }
}

/// Loads `kernel.yaml` (or `$AGRITRACK_KERNEL_CONFIG`). Missing or invalid
/// files fall back to defaults so the kernel still starts.
pub async fn load_config() -> KernelConfig {
    let path = std::env::var("AGRITRACK_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        match KernelConfig::load_from_path(&path).await {
            Ok(cfg) => {
                info!(%path, "config loaded");
                cfg
            }
            Err(e) => {
                error!(%path, "invalid config, using defaults: {e}");
                KernelConfig::default()
            }
        }
    } else {
        warn!(%path, "no config file, using defaults");
        KernelConfig::default()
    };
    cfg.apply_env();
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.mqtt.telemetry_topic, "agritrack/live/sensors");
        assert_eq!(cfg.thresholds.overheat_temp, 90.0);
        assert_eq!(cfg.fuel.history_capacity, 100);
        assert!(!cfg.alerts.sms_enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = concat!(
            "thresholds:\n  overheat_temp: 95\n",
            "alerts:\n  sms_enabled: true\n  cooldowns:\n    overheat: 60\n",
        );
        let cfg = KernelConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(cfg.thresholds.overheat_temp, 95.0);
        assert_eq!(cfg.thresholds.vibration, 0.5);
        assert!(cfg.alerts.sms_enabled);
        assert_eq!(cfg.alerts.cooldowns.get("overheat"), Some(&60));
        assert_eq!(cfg.workers.shards, 4);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let cfg = KernelConfig::from_yaml_str("   \n").unwrap();
        assert_eq!(cfg.http.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_invalid_fuel_levels_rejected() {
        let yaml = "fuel:\n  low_level: 5\n  critical_level: 10\n";
        let err = KernelConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_out_of_range_cooldown_rejected() {
        let yaml = "alerts:\n  cooldowns:\n    overheat: 18446744073709551615\n";
        let err = KernelConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let yaml = "alerts:\n  default_cooldown_secs: 9223372036854775808\n";
        assert!(KernelConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_supabase_requires_url() {
        let err = KernelConfig::from_yaml_str("store:\n  backend: supabase\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "mqtt:\n  host: broker.farm\n  port: 8883\nworkers:\n  shards: 8").unwrap();
        let cfg = KernelConfig::load_from_path(file.path()).await.unwrap();
        assert_eq!(cfg.mqtt.host, "broker.farm");
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.workers.shards, 8);
    }
}
