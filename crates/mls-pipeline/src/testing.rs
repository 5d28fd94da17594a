//! Test doubles for the external collaborators, shared by the pipeline,
//! agent and server test suites.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use mls_adapters::{
    AdapterResult, BuiltinCssProcessor, BuiltinJsMinifier, DeployResult, EdgeDeployer,
    ElementState, HeadlessBrowser, ImageCodec, MeasurementApi, Oracle, OraclePricing, OracleReply,
    RenderedPage, Services, TranscodeRequest, UpstreamError,
};
use mls_types::{
    CoreVitals, InteractiveElement, MeasureStrategy, MeasurementOutcome, TokenUsage, ViewportKind,
};

/// Serves canned HTML per URL; screenshots are deterministic bytes derived
/// from the URL and viewport so visual diffs compare equal across runs.
pub struct StaticSiteBrowser {
    pages: HashMap<String, String>,
    pub renders: AtomicUsize,
}

impl StaticSiteBrowser {
    pub fn new(pages: HashMap<String, String>) -> Self {
        Self {
            pages,
            renders: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl HeadlessBrowser for StaticSiteBrowser {
    async fn render(&self, url: &str, _viewport: ViewportKind) -> AdapterResult<RenderedPage> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let normalized = url.trim_end_matches('/');
        self.pages
            .iter()
            .find(|(known, _)| known.trim_end_matches('/') == normalized)
            .map(|(_, html)| RenderedPage {
                url: url.to_string(),
                html: html.clone(),
                final_url: None,
            })
            .ok_or_else(|| UpstreamError::fatal("browser", format!("no page for {url}")))
    }

    async fn screenshot(&self, url: &str, viewport: ViewportKind) -> AdapterResult<Vec<u8>> {
        let seed = format!("{url}|{}", viewport.as_str());
        Ok(seed.into_bytes())
    }

    async fn replay(
        &self,
        _url: &str,
        element: &InteractiveElement,
    ) -> AdapterResult<Vec<ElementState>> {
        Ok(vec![
            ElementState {
                phase: "before".to_string(),
                outer_html: format!("<div class=\"{}\"></div>", element.selector),
                visible: true,
            },
            ElementState {
                phase: "after".to_string(),
                outer_html: format!("<div class=\"{} active\"></div>", element.selector),
                visible: true,
            },
        ])
    }
}

/// Halves the payload, which is enough to observe "optimized smaller than
/// original" end to end.
pub struct HalvingCodec;

#[async_trait]
impl ImageCodec for HalvingCodec {
    async fn transcode(&self, bytes: &[u8], _request: &TranscodeRequest) -> AdapterResult<Vec<u8>> {
        Ok(bytes[..bytes.len() / 2].to_vec())
    }
}

pub struct RecordingEdge {
    pub deploys: AtomicUsize,
}

impl RecordingEdge {
    pub fn new() -> Self {
        Self {
            deploys: AtomicUsize::new(0),
        }
    }
}

impl Default for RecordingEdge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EdgeDeployer for RecordingEdge {
    async fn deploy(
        &self,
        project_name: &str,
        _directory: &Path,
        _source_url: &str,
    ) -> AdapterResult<DeployResult> {
        self.deploys.fetch_add(1, Ordering::SeqCst);
        Ok(DeployResult {
            url: format!("https://{project_name}.edge.test"),
        })
    }
}

/// Edge URLs measure fast, everything else slow.
pub struct CannedMeasurement;

#[async_trait]
impl MeasurementApi for CannedMeasurement {
    async fn measure(
        &self,
        url: &str,
        _strategy: MeasureStrategy,
    ) -> AdapterResult<MeasurementOutcome> {
        let optimized = url.contains(".edge.test");
        Ok(MeasurementOutcome {
            url: url.to_string(),
            performance: if optimized { 95.0 } else { 42.0 },
            vitals: CoreVitals {
                lcp_ms: if optimized { 1200.0 } else { 4300.0 },
                fcp_ms: if optimized { 700.0 } else { 2100.0 },
                tbt_ms: if optimized { 40.0 } else { 600.0 },
                cls: 0.01,
                ttfb_ms: if optimized { 80.0 } else { 700.0 },
            },
            total_bytes: if optimized { 400_000 } else { 2_200_000 },
            raw: serde_json::Value::Null,
        })
    }
}

/// Replays scripted completions in order; fails when the script runs dry.
pub struct ScriptedOracle {
    replies: Mutex<Vec<String>>,
}

impl ScriptedOracle {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies),
        }
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn complete(&self, _system: &str, _user: &str) -> AdapterResult<OracleReply> {
        let mut replies = self
            .replies
            .lock()
            .map_err(|_| UpstreamError::fatal("oracle", "poisoned script"))?;
        if replies.is_empty() {
            return Err(UpstreamError::fatal("oracle", "script exhausted"));
        }
        Ok(OracleReply {
            text: replies.remove(0),
            usage: TokenUsage {
                input_tokens: 1000,
                output_tokens: 200,
            },
        })
    }
}

/// Full service handle over the mocks above.
pub fn mock_services(pages: HashMap<String, String>, oracle_replies: Vec<String>) -> Services {
    Services {
        browser: Arc::new(StaticSiteBrowser::new(pages)),
        codec: Arc::new(HalvingCodec),
        css: Arc::new(BuiltinCssProcessor),
        js: Arc::new(BuiltinJsMinifier),
        edge: Arc::new(RecordingEdge::new()),
        measurement: Arc::new(CannedMeasurement),
        oracle: Arc::new(ScriptedOracle::new(oracle_replies)),
        oracle_pricing: OraclePricing::default(),
    }
}
