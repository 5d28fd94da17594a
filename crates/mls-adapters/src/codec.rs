use async_trait::async_trait;
use reqwest::Client;

use crate::error::{AdapterResult, UpstreamError};

const SERVICE: &str = "codec";

#[derive(Debug, Clone)]
pub struct TranscodeRequest {
    /// Target container, e.g. `webp`, `avif`, `jpeg`.
    pub format: String,
    /// 1..=100.
    pub quality: u8,
    /// Optional downscale bound; aspect ratio is preserved upstream.
    pub max_width: Option<u32>,
}

/// Pure byte transform over the external image codec service.
#[async_trait]
pub trait ImageCodec: Send + Sync {
    async fn transcode(&self, bytes: &[u8], request: &TranscodeRequest) -> AdapterResult<Vec<u8>>;
}

pub struct CodecServiceClient {
    base_url: String,
    client: Client,
}

impl CodecServiceClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl ImageCodec for CodecServiceClient {
    async fn transcode(&self, bytes: &[u8], request: &TranscodeRequest) -> AdapterResult<Vec<u8>> {
        let mut url = format!(
            "{}/transcode?format={}&quality={}",
            self.base_url, request.format, request.quality
        );
        if let Some(width) = request.max_width {
            url.push_str(&format!("&width={width}"));
        }
        let response = self
            .client
            .post(url)
            .header("content-type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|err| UpstreamError::from_http(SERVICE, err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // A 422 means the input bytes are bad, not the service: the
            // caller copies the original through.
            return Err(UpstreamError::from_status(SERVICE, status, &body));
        }
        let out = response
            .bytes()
            .await
            .map_err(|err| UpstreamError::transient(SERVICE, err.to_string()))?;
        if out.is_empty() {
            return Err(UpstreamError::fatal(SERVICE, "codec returned empty output"));
        }
        Ok(out.to_vec())
    }
}
