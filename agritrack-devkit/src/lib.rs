/*!
# AgriTrack DevKit - Stubs and helpers for kernel development

- MQTT stub (publisher and inbound feed) for tests without a broker
- Recording notification gateway
- Telemetry payload builders and geofence fixtures
- A harness assembling a full kernel over in-memory collaborators
*/

pub mod fixtures;
pub mod mqtt_stub;
pub mod notify_stub;
pub mod test_utils;

pub use fixtures::TelemetryMessageBuilder;
pub use mqtt_stub::MockMqttClient;
pub use notify_stub::{RecordingGateway, SentNotification};
pub use test_utils::TestHarness;
