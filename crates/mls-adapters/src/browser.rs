use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use mls_types::{InteractiveElement, ViewportKind};

use crate::error::{AdapterResult, UpstreamError};

const SERVICE: &str = "browser";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
    /// URL after redirects, used to keep crawling same-origin.
    #[serde(default)]
    pub final_url: Option<String>,
}

/// Before/after DOM snapshot captured while replaying an interaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElementState {
    pub phase: String,
    pub outer_html: String,
    #[serde(default)]
    pub visible: bool,
}

/// Narrow interface over the external headless-browser automation service.
#[async_trait]
pub trait HeadlessBrowser: Send + Sync {
    /// Fully rendered HTML for the URL at the viewport.
    async fn render(&self, url: &str, viewport: ViewportKind) -> AdapterResult<RenderedPage>;

    /// Raw pixel buffer for the rendered page; stable across identical
    /// renders so buffers compare byte-for-byte.
    async fn screenshot(&self, url: &str, viewport: ViewportKind) -> AdapterResult<Vec<u8>>;

    /// Replays the element's declared action and returns the captured
    /// before/after states.
    async fn replay(
        &self,
        url: &str,
        element: &InteractiveElement,
    ) -> AdapterResult<Vec<ElementState>>;
}

/// HTTP client for a browserless-style automation endpoint.
pub struct RemoteBrowser {
    base_url: String,
    client: Client,
}

impl RemoteBrowser {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl HeadlessBrowser for RemoteBrowser {
    async fn render(&self, url: &str, viewport: ViewportKind) -> AdapterResult<RenderedPage> {
        let (width, height) = viewport.dimensions();
        let response = self
            .client
            .post(format!("{}/render", self.base_url))
            .json(&json!({"url": url, "width": width, "height": height, "waitUntil": "networkidle"}))
            .send()
            .await
            .map_err(|err| UpstreamError::from_http(SERVICE, err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(SERVICE, status, &body));
        }
        response
            .json()
            .await
            .map_err(|err| UpstreamError::transient(SERVICE, err.to_string()))
    }

    async fn screenshot(&self, url: &str, viewport: ViewportKind) -> AdapterResult<Vec<u8>> {
        let (width, height) = viewport.dimensions();
        let response = self
            .client
            .post(format!("{}/screenshot", self.base_url))
            .json(&json!({"url": url, "width": width, "height": height, "fullPage": true}))
            .send()
            .await
            .map_err(|err| UpstreamError::from_http(SERVICE, err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(SERVICE, status, &body));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| UpstreamError::transient(SERVICE, err.to_string()))?;
        if bytes.is_empty() {
            return Err(UpstreamError::transient(SERVICE, "empty screenshot"));
        }
        Ok(bytes.to_vec())
    }

    async fn replay(
        &self,
        url: &str,
        element: &InteractiveElement,
    ) -> AdapterResult<Vec<ElementState>> {
        let response = self
            .client
            .post(format!("{}/interact", self.base_url))
            .json(&json!({
                "url": url,
                "selector": element.selector,
                "action": element.action,
            }))
            .send()
            .await
            .map_err(|err| UpstreamError::from_http(SERVICE, err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(SERVICE, status, &body));
        }
        response
            .json()
            .await
            .map_err(|err| UpstreamError::transient(SERVICE, err.to_string()))
    }
}
