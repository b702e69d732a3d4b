//! Generation API client.
//!
//! The upstream image-synthesis API is a consumed interface: opaque latency,
//! opaque availability, and a hard rate limit. Everything that leaves this
//! process for it goes through [`GenerationClient`], which stacks a shared
//! token-bucket [`RateLimiter`], a per-call hard timeout, and classified
//! retry with exponential backoff and jitter on top of an [`ImageGenerator`]
//! implementation.

pub mod limiter;
pub mod retry;

pub use limiter::RateLimiter;
pub use retry::{GenerationClient, RetryPolicy, UnitOutcome};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;
use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// Request / Response
// ═══════════════════════════════════════════════════════════════════════════════

/// One generation call: produces a single image.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reference_images: Vec<String>,
    pub size: String,
}

/// A successfully generated image.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedImage {
    /// Provider-hosted URL of the result
    pub url: String,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Generator Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A single uncontrolled call to the generation API.
///
/// Implementations perform exactly one attempt; rate limiting, timeout, and
/// retry live in [`GenerationClient`].
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// HTTP Implementation
// ═══════════════════════════════════════════════════════════════════════════════

/// reqwest-backed generator.
pub struct HttpImageGenerator {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpImageGenerator {
    /// Create a generator from configuration.
    ///
    /// No client-level total timeout is set: the hard per-call timeout is
    /// applied by [`GenerationClient`] with `tokio::time::timeout`, which
    /// aborts the in-flight request when it fires instead of leaving it
    /// running in the background.
    pub fn new(cfg: &GenerationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(crate::error::AtelierError::from)?;

        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
        })
    }
}

#[async_trait]
impl ImageGenerator for HttpImageGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GeneratedImage> {
        let url = format!("{}/v1/images/generations", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await?
            .error_for_status()?;

        let image: GeneratedImage = response.json().await?;
        Ok(image)
    }
}
