//! Stateless threshold checks on a normalized reading.

use crate::config::ThresholdConf;
use crate::models::{AlertType, CandidateAlert, SensorReading, Severity};
use serde_json::json;

/// Severity escalates to critical above this multiple of the vibration threshold.
const VIBRATION_CRITICAL_FACTOR: f64 = 1.5;

#[derive(Debug, Clone)]
pub struct ThresholdDetector {
    overheat_temp: f64,
    vibration: f64,
}

impl ThresholdDetector {
    pub fn new(conf: &ThresholdConf) -> Self {
        Self {
            overheat_temp: conf.overheat_temp,
            vibration: conf.vibration,
        }
    }

    pub fn evaluate(&self, reading: &SensorReading) -> Vec<CandidateAlert> {
        let mut alerts = Vec::new();

        if reading.temperature > self.overheat_temp {
            alerts.push(CandidateAlert::new(
                AlertType::Overheat,
                Severity::Critical,
                format!(
                    "Temperature {:.1}°C exceeds {:.1}°C threshold",
                    reading.temperature, self.overheat_temp
                ),
                json!({ "temperature": reading.temperature, "threshold": self.overheat_temp }),
            ));
        }

        let magnitude = reading.vibration.magnitude();
        if magnitude > self.vibration {
            let severity = if magnitude > self.vibration * VIBRATION_CRITICAL_FACTOR {
                Severity::Critical
            } else {
                Severity::Warning
            };
            alerts.push(CandidateAlert::new(
                AlertType::Vibration,
                severity,
                format!("Vibration {:.3} exceeds {:.3} threshold", magnitude, self.vibration),
                json!({
                    "magnitude": magnitude,
                    "threshold": self.vibration,
                    "x": reading.vibration.x,
                    "y": reading.vibration.y,
                    "z": reading.vibration.z,
                }),
            ));
        }

        alerts
    }
}

impl Default for ThresholdDetector {
    fn default() -> Self {
        Self::new(&ThresholdConf::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Vibration;
    use time::OffsetDateTime;

    fn reading(temp: f64, vib: (f64, f64, f64)) -> SensorReading {
        SensorReading {
            machine_id: "sim_001".into(),
            temperature: temp,
            vibration: Vibration::new(vib.0, vib.1, vib.2),
            position: None,
            speed: Some(8.0),
            fuel_level: None,
            engine_hours: None,
            timestamp: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_normal_reading_is_quiet() {
        let detector = ThresholdDetector::default();
        assert!(detector.evaluate(&reading(60.0, (0.1, 0.05, 0.02))).is_empty());
    }

    #[test]
    fn test_overheat_is_critical_and_strict() {
        let detector = ThresholdDetector::default();
        assert!(detector.evaluate(&reading(90.0, (0.0, 0.0, 0.0))).is_empty());

        let alerts = detector.evaluate(&reading(95.0, (0.0, 0.0, 0.0)));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::Overheat);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[test]
    fn test_vibration_severity_escalation() {
        let detector = ThresholdDetector::default();

        let warning = detector.evaluate(&reading(50.0, (0.6, 0.0, 0.0)));
        assert_eq!(warning.len(), 1);
        assert_eq!(warning[0].alert_type, AlertType::Vibration);
        assert_eq!(warning[0].severity, Severity::Warning);
        assert!((warning[0].data["magnitude"].as_f64().unwrap() - 0.6).abs() < 1e-9);

        // exactly 1.5x is still a warning
        let edge = detector.evaluate(&reading(50.0, (0.75, 0.0, 0.0)));
        assert_eq!(edge[0].severity, Severity::Warning);

        let critical = detector.evaluate(&reading(50.0, (0.6, 0.5, 0.0)));
        assert_eq!(critical[0].severity, Severity::Critical);
    }

    #[test]
    fn test_custom_thresholds() {
        let detector = ThresholdDetector::new(&ThresholdConf {
            overheat_temp: 100.0,
            vibration: 1.0,
            idle_speed: 1.0,
        });
        assert!(detector.evaluate(&reading(95.0, (0.6, 0.0, 0.0))).is_empty());
        assert_eq!(detector.evaluate(&reading(101.0, (1.2, 0.0, 0.0))).len(), 2);
    }
}
