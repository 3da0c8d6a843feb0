use crate::error::DeliveryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Remote end of the uplink. Implementations do not retry internally.
#[async_trait]
pub trait RemoteSink: Send + Sync {
    async fn upload(
        &self,
        event_id: &str,
        timestamp: DateTime<Utc>,
        image: Vec<u8>,
    ) -> Result<(), DeliveryError>;

    /// Post a JSON document to the log endpoint
    async fn log(&self, body: &Value) -> Result<(), DeliveryError>;
}

/// Dashboard API client
pub struct HttpRemoteSink {
    client: Client,
    image_url: String,
    logs_url: String,
    token: String,
    tz: Tz,
}

impl HttpRemoteSink {
    pub fn new(site_url: &str, token: &str, timeout: Duration, tz: Tz) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        let site = site_url.trim_end_matches('/');

        Self {
            client,
            image_url: format!("{site}/core/api/image/"),
            logs_url: format!("{site}/core/api/logs/"),
            token: token.to_string(),
            tz,
        }
    }

    fn check(status: StatusCode) -> Result<(), DeliveryError> {
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

#[async_trait]
impl RemoteSink for HttpRemoteSink {
    async fn upload(
        &self,
        event_id: &str,
        timestamp: DateTime<Utc>,
        image: Vec<u8>,
    ) -> Result<(), DeliveryError> {
        let date = timestamp.with_timezone(&self.tz).format("%Y-%m-%d").to_string();
        let file = Part::bytes(image)
            .file_name(format!("{}.jpg", timestamp.timestamp_millis()))
            .mime_str("image/jpeg")?;
        let form = Form::new()
            .text("uuid", event_id.to_string())
            .text("date", date)
            .part("file", file);

        let response = self
            .client
            .post(&self.image_url)
            .header("Authorization", format!("Token {}", self.token))
            .multipart(form)
            .send()
            .await?;

        debug!("Upload of {} answered {}", event_id, response.status());
        Self::check(response.status())
    }

    async fn log(&self, body: &Value) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(&self.logs_url)
            .header("Authorization", format!("Token {}", self.token))
            .json(body)
            .send()
            .await?;
        Self::check(response.status())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedUpload {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub bytes: usize,
}

/// In-memory sink with switchable failure
#[derive(Default)]
pub struct MockRemoteSink {
    uploads: Mutex<Vec<RecordedUpload>>,
    logs: Mutex<Vec<Value>>,
    failing: AtomicBool,
    attempts: Mutex<u64>,
}

impl MockRemoteSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().clone()
    }

    pub fn logs(&self) -> Vec<Value> {
        self.logs.lock().clone()
    }

    /// Upload calls made, successful or not
    pub fn attempts(&self) -> u64 {
        *self.attempts.lock()
    }

    fn outcome(&self) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(DeliveryError::Transport {
                details: "link down".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RemoteSink for MockRemoteSink {
    async fn upload(
        &self,
        event_id: &str,
        timestamp: DateTime<Utc>,
        image: Vec<u8>,
    ) -> Result<(), DeliveryError> {
        *self.attempts.lock() += 1;
        self.outcome()?;
        self.uploads.lock().push(RecordedUpload {
            event_id: event_id.to_string(),
            timestamp,
            bytes: image.len(),
        });
        Ok(())
    }

    async fn log(&self, body: &Value) -> Result<(), DeliveryError> {
        self.outcome()?;
        self.logs.lock().push(body.clone());
        Ok(())
    }
}
