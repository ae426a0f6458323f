/*!
Mock MQTT client for development without a broker

Outbound: implements the kernel's `MessagePublisher` and records every
publish, so the live bridge can run against it.
Inbound: `simulate_incoming` feeds the channel returned by `setup_receiver`,
standing in for the broker side of the listener's event loop.
*/

use agritrack_kernel::mqtt::{MessagePublisher, TransportError};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    message_sender: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel receiving the messages passed to `simulate_incoming`.
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.message_sender.lock() = Some(sender);
        receiver
    }

    pub fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let message = MockMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
        };
        match self.message_sender.lock().as_ref() {
            Some(sender) => sender
                .send(message)
                .map_err(|e| anyhow::anyhow!("Send error: {}", e)),
            None => anyhow::bail!("no receiver, call setup_receiver first"),
        }
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Last message of a topic parsed as JSON.
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MessagePublisher for MockMqttClient {
    async fn publish_retained(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        tracing::debug!(%topic, bytes = payload.len(), "[mock] published");
        self.published_messages.lock().push(MockMessage {
            topic: topic.to_string(),
            payload,
            qos: QoS::AtLeastOnce,
            retain: true,
        });
        Ok(())
    }
}
