mod browser;
mod codec;
mod css;
mod edge;
mod error;
mod js;
mod measure;
mod oracle;

pub use browser::{ElementState, HeadlessBrowser, RemoteBrowser, RenderedPage};
pub use codec::{CodecServiceClient, ImageCodec, TranscodeRequest};
pub use css::{BuiltinCssProcessor, CssProcessor, Safelist};
pub use edge::{DeployResult, EdgeApiClient, EdgeDeployer};
pub use error::{AdapterResult, UpstreamError};
pub use js::{BuiltinJsMinifier, JsMinifier};
pub use measure::{outcome_from_payload, MeasurementApi, PageSpeedClient};
pub use oracle::{
    extract_json, parse_plan, parse_review, MessagesApiOracle, Oracle, OraclePricing, OracleReply,
};

use std::sync::Arc;

/// Connection details for every external collaborator.
#[derive(Debug, Clone, Default)]
pub struct AdapterConfig {
    pub browser_url: String,
    pub codec_url: String,
    pub edge_url: String,
    pub edge_token: String,
    pub measurement_url: String,
    pub measurement_key: String,
    pub oracle_url: String,
    pub oracle_key: String,
    pub oracle_model: String,
    pub oracle_pricing: OraclePricing,
}

/// Typed service handle carried through job context; initialized once in
/// `main` and passed explicitly, never a process-wide singleton.
#[derive(Clone)]
pub struct Services {
    pub browser: Arc<dyn HeadlessBrowser>,
    pub codec: Arc<dyn ImageCodec>,
    pub css: Arc<dyn CssProcessor>,
    pub js: Arc<dyn JsMinifier>,
    pub edge: Arc<dyn EdgeDeployer>,
    pub measurement: Arc<dyn MeasurementApi>,
    pub oracle: Arc<dyn Oracle>,
    pub oracle_pricing: OraclePricing,
}

impl Services {
    pub fn from_config(config: &AdapterConfig) -> Self {
        Self {
            browser: Arc::new(RemoteBrowser::new(&config.browser_url)),
            codec: Arc::new(CodecServiceClient::new(&config.codec_url)),
            css: Arc::new(BuiltinCssProcessor),
            js: Arc::new(BuiltinJsMinifier),
            edge: Arc::new(EdgeApiClient::new(&config.edge_url, &config.edge_token)),
            measurement: Arc::new(PageSpeedClient::new(
                &config.measurement_url,
                &config.measurement_key,
            )),
            oracle: Arc::new(MessagesApiOracle::new(
                &config.oracle_url,
                &config.oracle_key,
                &config.oracle_model,
            )),
            oracle_pricing: config.oracle_pricing,
        }
    }
}
