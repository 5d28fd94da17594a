use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use mls_adapters::{AdapterConfig, OraclePricing};

fn default_workers() -> usize {
    2
}

fn default_keep_artifacts() -> usize {
    10
}

fn default_oracle_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_oracle_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_measurement_url() -> String {
    "https://www.googleapis.com/pagespeedonline/v5".to_string()
}

fn default_input_price() -> f64 {
    3.0
}

fn default_output_price() -> f64 {
    15.0
}

/// Engine configuration: `config.json` under the data root deep-merged with
/// an `MLS_*` environment layer, env winning.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Master API key for the bearer-token middleware.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub browser_url: String,
    #[serde(default)]
    pub codec_url: String,
    #[serde(default)]
    pub edge_url: String,
    #[serde(default)]
    pub edge_token: String,
    #[serde(default = "default_measurement_url")]
    pub measurement_url: String,
    #[serde(default)]
    pub measurement_key: String,
    #[serde(default = "default_oracle_url")]
    pub oracle_url: String,
    #[serde(default)]
    pub oracle_key: String,
    /// Model id and price table are deployment knobs, not constants.
    #[serde(default = "default_oracle_model")]
    pub oracle_model: String,
    #[serde(default = "default_input_price")]
    pub oracle_input_per_mtok: f64,
    #[serde(default = "default_output_price")]
    pub oracle_output_per_mtok: f64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_keep_artifacts")]
    pub keep_artifacts: usize,
}

impl EngineConfig {
    pub fn load(data_root: &Path) -> anyhow::Result<Self> {
        let file_layer = read_config_file(&data_root.join("config.json"))?;
        let merged = mls_settings::merged(&file_layer, &env_layer());
        let config: EngineConfig = serde_json::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.api_key.trim().is_empty() {
            anyhow::bail!("apiKey is required (config.json or MLS_API_KEY)");
        }
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        Ok(())
    }

    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            browser_url: self.browser_url.clone(),
            codec_url: self.codec_url.clone(),
            edge_url: self.edge_url.clone(),
            edge_token: self.edge_token.clone(),
            measurement_url: self.measurement_url.clone(),
            measurement_key: self.measurement_key.clone(),
            oracle_url: self.oracle_url.clone(),
            oracle_key: self.oracle_key.clone(),
            oracle_model: self.oracle_model.clone(),
            oracle_pricing: OraclePricing {
                input_per_mtok: self.oracle_input_per_mtok,
                output_per_mtok: self.oracle_output_per_mtok,
            },
        }
    }
}

fn read_config_file(path: &PathBuf) -> anyhow::Result<Value> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(serde_json::from_str(&raw)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(json!({})),
        Err(err) => Err(err.into()),
    }
}

const ENV_KEYS: [(&str, &str); 13] = [
    ("MLS_API_KEY", "apiKey"),
    ("MLS_BROWSER_URL", "browserUrl"),
    ("MLS_CODEC_URL", "codecUrl"),
    ("MLS_EDGE_URL", "edgeUrl"),
    ("MLS_EDGE_TOKEN", "edgeToken"),
    ("MLS_MEASUREMENT_URL", "measurementUrl"),
    ("MLS_MEASUREMENT_KEY", "measurementKey"),
    ("MLS_ORACLE_URL", "oracleUrl"),
    ("MLS_ORACLE_KEY", "oracleKey"),
    ("MLS_ORACLE_MODEL", "oracleModel"),
    ("MLS_WORKERS", "workers"),
    ("MLS_KEEP_ARTIFACTS", "keepArtifacts"),
    ("MLS_ORACLE_INPUT_PER_MTOK", "oracleInputPerMtok"),
];

fn env_layer() -> Value {
    let mut layer = Map::new();
    for (env_name, key) in ENV_KEYS {
        let Ok(raw) = std::env::var(env_name) else {
            continue;
        };
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        // Only the numeric knobs parse as numbers; a key that happens to
        // look numeric must stay a string.
        let numeric = matches!(key, "workers" | "keepArtifacts" | "oracleInputPerMtok");
        let value = if numeric {
            trimmed
                .parse::<u64>()
                .map(|n| json!(n))
                .or_else(|_| trimmed.parse::<f64>().map(|n| json!(n)))
                .unwrap_or_else(|_| json!(trimmed))
        } else {
            json!(trimmed)
        };
        layer.insert(key.to_string(), value);
    }
    Value::Object(layer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_layer_parses_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.json"),
            json!({"apiKey": "k", "edgeUrl": "https://edge.test"}).to_string(),
        )
        .unwrap();
        let config = EngineConfig::load(tmp.path()).unwrap();
        assert_eq!(config.api_key, "k");
        assert_eq!(config.edge_url, "https://edge.test");
        assert_eq!(config.workers, default_workers());
        assert_eq!(config.oracle_url, default_oracle_url());
    }

    #[test]
    fn missing_api_key_fails_validation() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(EngineConfig::load(tmp.path()).is_err());
    }
}
