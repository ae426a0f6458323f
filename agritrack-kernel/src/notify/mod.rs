/**
 * NOTIFY - Outbound notification channels
 *
 * ROLE :
 * `NotificationGateway` is the seam to push and SMS providers. The dispatcher
 * never calls it directly: notification jobs run on the outbound queue and
 * resolve recipients through the `ContactDirectory`.
 *
 * IMPLEMENTATIONS :
 * - `LogGateway` : logs every message, default when no provider is configured
 * - `http::HttpGateway` : Expo push API + SMS webhook
 */

pub mod http;

use crate::store::MachineStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub use http::HttpGateway;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Channel not configured: {0}")]
    NotConfigured(&'static str),
    #[error("Provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OwnerContact {
    pub owner_name: String,
    pub push_tokens: Vec<String>,
    pub phone: Option<String>,
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn send_push(
        &self,
        token: &str,
        title: &str,
        body: &str,
        data: &Value,
    ) -> Result<(), NotifyError>;

    async fn send_sms(&self, number: &str, text: &str) -> Result<(), NotifyError>;
}

pub struct LogGateway;

#[async_trait]
impl NotificationGateway for LogGateway {
    async fn send_push(
        &self,
        token: &str,
        title: &str,
        body: &str,
        _data: &Value,
    ) -> Result<(), NotifyError> {
        info!(%token, %title, %body, "push (log only)");
        Ok(())
    }

    async fn send_sms(&self, number: &str, text: &str) -> Result<(), NotifyError> {
        info!(%number, %text, "sms (log only)");
        Ok(())
    }
}

/// Owner contacts cached per machine with a fixed TTL. Misses (machines
/// without an owner) are cached too; store failures are not.
pub struct ContactDirectory {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Option<OwnerContact>, Instant)>>,
}

impl ContactDirectory {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    pub async fn lookup(&self, device_id: &str, store: &dyn MachineStore) -> Option<OwnerContact> {
        let cached = self
            .entries
            .lock()
            .get(device_id)
            .filter(|(_, fetched)| fetched.elapsed() < self.ttl)
            .map(|(contact, _)| contact.clone());
        if let Some(contact) = cached {
            return contact;
        }

        match store.owner_contact(device_id).await {
            Ok(contact) => {
                self.entries
                    .lock()
                    .insert(device_id.to_string(), (contact.clone(), Instant::now()));
                contact
            }
            Err(e) => {
                warn!(machine_id = %device_id, "owner contact lookup failed: {e}");
                None
            }
        }
    }

    /// Returns true if an entry was cached.
    pub fn invalidate(&self, device_id: &str) -> bool {
        self.entries.lock().remove(device_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
