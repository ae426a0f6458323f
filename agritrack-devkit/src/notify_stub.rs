//! Notification gateway that records instead of sending.

use agritrack_kernel::notify::{NotificationGateway, NotifyError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub enum SentNotification {
    Push { token: String, title: String, body: String, data: Value },
    Sms { number: String, text: String },
}

#[derive(Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<SentNotification>>,
    failing: AtomicBool,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send fails while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().clone()
    }

    pub fn pushes(&self) -> usize {
        self.sent.lock().iter().filter(|n| matches!(n, SentNotification::Push { .. })).count()
    }

    pub fn sms(&self) -> usize {
        self.sent.lock().iter().filter(|n| matches!(n, SentNotification::Sms { .. })).count()
    }

    fn check(&self) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Rejected {
                status: 503,
                body: "recording gateway set to fail".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn send_push(
        &self,
        token: &str,
        title: &str,
        body: &str,
        data: &Value,
    ) -> Result<(), NotifyError> {
        self.check()?;
        self.sent.lock().push(SentNotification::Push {
            token: token.into(),
            title: title.into(),
            body: body.into(),
            data: data.clone(),
        });
        Ok(())
    }

    async fn send_sms(&self, number: &str, text: &str) -> Result<(), NotifyError> {
        self.check()?;
        self.sent.lock().push(SentNotification::Sms { number: number.into(), text: text.into() });
        Ok(())
    }
}
