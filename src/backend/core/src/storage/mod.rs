//! Object storage upload — a consumed interface.
//!
//! The worker re-hosts each generated image so job results do not depend on
//! the provider's short-lived URLs. Storage internals are out of scope; this
//! module only defines the seam and a reqwest-backed default.

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::StorageConfig;
use crate::error::{AtelierError, ErrorCode, Result};

/// Uploads bytes and returns a public URL.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> Result<String>;

    /// Fetch a provider-hosted image and re-upload it, returning the public
    /// URL. Default implementation suits stores that only take raw bytes.
    async fn upload_from_url(&self, source_url: &str) -> Result<String>;
}

/// reqwest-backed store speaking a simple upload endpoint.
pub struct HttpObjectStore {
    client: reqwest::Client,
    upload_url: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

impl HttpObjectStore {
    pub fn new(cfg: &StorageConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(AtelierError::from)?;

        Ok(Self {
            client,
            upload_url: cfg.upload_url.clone(),
            access_token: cfg.access_token.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.upload_url)
            .bearer_auth(&self.access_token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| {
                AtelierError::with_internal(
                    ErrorCode::UploadFailed,
                    "Failed to store generated image",
                    e.to_string(),
                )
            })?;

        let parsed: UploadResponse = response.json().await?;
        Ok(parsed.url)
    }

    async fn upload_from_url(&self, source_url: &str) -> Result<String> {
        let response = self
            .client
            .get(source_url)
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();

        let bytes = response.bytes().await?.to_vec();
        self.upload(bytes, &content_type).await
    }
}
