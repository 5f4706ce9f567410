//! Multipart upload of rendered charts.

use crate::config::PublishConfig;
use crate::error::WorkflowError;
use crate::graph::Publisher;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct UploadReply {
    #[serde(default)]
    url: Option<String>,
}

/// Publishes images to an HTTP file host that answers `{"url": ...}`.
pub struct HttpPublisher {
    http_client: reqwest::Client,
    upload_url: String,
}

impl HttpPublisher {
    pub fn new(config: &PublishConfig) -> Result<Self, WorkflowError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| WorkflowError::Upload(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            upload_url: config.upload_url.clone(),
        })
    }
}

/// `<timestamp>-<suffix>.png`, unique enough for concurrent uploads.
pub fn upload_file_name() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}.png",
        Utc::now().format("%Y%m%d-%H%M%S"),
        &suffix[..3]
    )
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, image: Vec<u8>) -> Result<String, WorkflowError> {
        let file_name = upload_file_name();
        debug!("Uploading {} ({} bytes)", file_name, image.len());

        let part = Part::bytes(image)
            .file_name(file_name)
            .mime_str("image/png")
            .map_err(|e| WorkflowError::Upload(e.to_string()))?;
        let form = Form::new().part("file", part);

        let response = self
            .http_client
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WorkflowError::Upload("upload timed out".to_string())
                } else {
                    WorkflowError::Upload(format!("Failed to send upload: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(WorkflowError::Upload(format!("file host returned {}: {}", status, body)));
        }

        let reply: UploadReply = response
            .json()
            .await
            .map_err(|e| WorkflowError::Upload(format!("unreadable upload response: {}", e)))?;

        reply
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| WorkflowError::Upload("upload response has no url field".to_string()))
    }
}
