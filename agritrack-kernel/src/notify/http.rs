//! HTTP notification providers: Expo push API and a generic SMS webhook.

use super::{NotificationGateway, NotifyError};
use crate::config::NotifyConf;
use async_trait::async_trait;
use reqwest::Response;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

pub struct HttpGateway {
    client: reqwest::Client,
    push_url: String,
    sms_url: Option<String>,
    sms_token: Option<String>,
    sms_from: Option<String>,
}

impl HttpGateway {
    pub fn new(conf: &NotifyConf) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(conf.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            push_url: conf.push_url.clone(),
            sms_url: conf.sms_url.clone(),
            sms_token: conf.sms_token.clone(),
            sms_from: conf.sms_from.clone(),
        })
    }

    async fn check(response: Response) -> Result<(), NotifyError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Rejected { status: status.as_u16(), body })
    }
}

fn push_message(token: &str, title: &str, body: &str, data: &Value) -> Value {
    json!({
        "to": token,
        "title": title,
        "body": body,
        "data": data,
        "sound": "default",
        "priority": "high",
    })
}

#[async_trait]
impl NotificationGateway for HttpGateway {
    async fn send_push(
        &self,
        token: &str,
        title: &str,
        body: &str,
        data: &Value,
    ) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.push_url)
            .json(&push_message(token, title, body, data))
            .send()
            .await?;
        Self::check(response).await?;
        debug!(%token, "push delivered");
        Ok(())
    }

    async fn send_sms(&self, number: &str, text: &str) -> Result<(), NotifyError> {
        let url = self.sms_url.as_deref().ok_or(NotifyError::NotConfigured("sms_url"))?;
        let mut request = self
            .client
            .post(url)
            .json(&json!({ "to": number, "from": self.sms_from, "body": text }));
        if let Some(token) = &self.sms_token {
            request = request.bearer_auth(token);
        }
        Self::check(request.send().await?).await?;
        debug!(%number, "sms delivered");
        Ok(())
    }
}
