use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use mls_types::{AiReviewDecision, OptimizationPlan, TokenUsage};

use crate::error::{AdapterResult, UpstreamError};

const SERVICE: &str = "oracle";

/// A completed oracle call with its token accounting.
#[derive(Debug, Clone)]
pub struct OracleReply {
    pub text: String,
    pub usage: TokenUsage,
}

/// Stateless text/JSON endpoint. Plan and review prompts go through the
/// same `complete` contract; parsing happens on this side of the seam.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> AdapterResult<OracleReply>;
}

/// Price pair in USD per million tokens; configurable because the upstream
/// model and its pricing change out from under us.
#[derive(Debug, Clone, Copy)]
pub struct OraclePricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Default for OraclePricing {
    fn default() -> Self {
        Self {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        }
    }
}

pub struct MessagesApiOracle {
    base_url: String,
    api_key: String,
    model: String,
    client: Client,
}

impl MessagesApiOracle {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<MessagesContent>,
    #[serde(default)]
    usage: MessagesUsage,
}

#[derive(Deserialize)]
struct MessagesContent {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[async_trait]
impl Oracle for MessagesApiOracle {
    async fn complete(&self, system: &str, user: &str) -> AdapterResult<OracleReply> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": self.model,
                "max_tokens": 8192,
                "system": system,
                "messages": [{"role": "user", "content": user}],
            }))
            .send()
            .await
            .map_err(|err| UpstreamError::from_http(SERVICE, err))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(SERVICE, status, &body));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|err| UpstreamError::transient(SERVICE, err.to_string()))?;
        let text = parsed
            .content
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            return Err(UpstreamError::transient(SERVICE, "empty completion"));
        }
        Ok(OracleReply {
            text,
            usage: TokenUsage {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
            },
        })
    }
}

/// Pulls a JSON document out of a completion, tolerating markdown fences
/// and prose around the payload.
pub fn extract_json(text: &str) -> AdapterResult<serde_json::Value> {
    let trimmed = text.trim();
    let candidate = if let Some(fenced) = trimmed.split("```").nth(1) {
        fenced.trim_start_matches("json").trim()
    } else {
        trimmed
    };
    let candidate = match (candidate.find('{'), candidate.rfind('}')) {
        (Some(start), Some(end)) if end > start => &candidate[start..=end],
        _ => {
            return Err(UpstreamError::transient(
                SERVICE,
                "completion contained no JSON object",
            ))
        }
    };
    serde_json::from_str(candidate)
        .map_err(|err| UpstreamError::transient(SERVICE, format!("malformed JSON: {err}")))
}

/// Schema-validates a plan completion. Any mismatch is retryable.
pub fn parse_plan(text: &str) -> AdapterResult<OptimizationPlan> {
    let value = extract_json(text)?;
    serde_json::from_value(value)
        .map_err(|err| UpstreamError::transient(SERVICE, format!("plan schema mismatch: {err}")))
}

/// Schema-validates a review completion. Any mismatch is retryable.
pub fn parse_review(text: &str) -> AdapterResult<AiReviewDecision> {
    let value = extract_json(text)?;
    serde_json::from_value(value)
        .map_err(|err| UpstreamError::transient(SERVICE, format!("review schema mismatch: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mls_types::ReviewVerdict;

    #[test]
    fn extracts_json_from_fenced_completion() {
        let text = "Here is the plan:\n```json\n{\"verdict\": \"pass\", \"reasoning\": \"ok\"}\n```\nDone.";
        let decision = parse_review(text).unwrap();
        assert_eq!(decision.verdict, ReviewVerdict::Pass);
    }

    #[test]
    fn extracts_bare_json() {
        let text = "{\"settings\": {\"css\": {}}, \"rationale\": {\"css\": \"trim unused\"}}";
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.rationale["css"], "trim unused");
    }

    #[test]
    fn prose_without_json_is_retryable() {
        let err = parse_review("I could not decide.").unwrap_err();
        assert!(err.retryable);
    }

    #[test]
    fn schema_mismatch_is_retryable() {
        let err = parse_review("{\"verdict\": \"maybe\", \"reasoning\": \"?\"}").unwrap_err();
        assert!(err.retryable);
    }
}
