use crate::registry::plugin_settings;
use async_trait::async_trait;
use ess_lib::{EssError, EssEvent, EssResult, MessagingSender};
use log::info;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Writes every event to the log.
#[derive(Debug, Default)]
pub struct LogEventSender;

#[async_trait]
impl MessagingSender for LogEventSender {
    async fn send(&self, event: &EssEvent) -> EssResult<()> {
        info!("event: {}", event.to_message());
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSenderSettings {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for HttpSenderSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            timeout_secs: 10,
        }
    }
}

/// POSTs each event as JSON to a webhook.
pub struct HttpEventSender {
    url: String,
    client: Client,
}

impl HttpEventSender {
    pub fn new(settings: HttpSenderSettings) -> EssResult<Self> {
        if settings.url.trim().is_empty() {
            return Err(EssError::InvalidParam(
                "http messaging sender needs a url".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| EssError::Internal(format!("build messaging client: {}", e)))?;
        Ok(Self {
            url: settings.url,
            client,
        })
    }

    pub fn from_settings(settings: &toml::Table) -> EssResult<Self> {
        Self::new(plugin_settings("http", settings)?)
    }
}

#[async_trait]
impl MessagingSender for HttpEventSender {
    async fn send(&self, event: &EssEvent) -> EssResult<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&event.to_message())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(EssError::from_http_status(
                resp.status(),
                format!("POST {}", self.url),
            ));
        }
        Ok(())
    }
}
