use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use mls_types::{CoreVitals, MeasureStrategy, MeasurementOutcome};

use crate::error::{AdapterResult, UpstreamError};

const SERVICE: &str = "measurement";

/// External page-speed measurement endpoint.
#[async_trait]
pub trait MeasurementApi: Send + Sync {
    async fn measure(&self, url: &str, strategy: MeasureStrategy)
        -> AdapterResult<MeasurementOutcome>;
}

/// PageSpeed-style client. Timeouts and rate-limits here are the canonical
/// retryable upstream failure.
pub struct PageSpeedClient {
    base_url: String,
    api_key: String,
    client: Client,
}

impl PageSpeedClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client: Client::new(),
        }
    }
}

fn audit_ms(payload: &Value, audit: &str) -> f64 {
    payload["lighthouseResult"]["audits"][audit]["numericValue"]
        .as_f64()
        .unwrap_or(0.0)
}

/// Maps the raw endpoint payload into our typed outcome; kept separate so
/// the parsing is testable without the network.
pub fn outcome_from_payload(url: &str, payload: Value) -> AdapterResult<MeasurementOutcome> {
    let score = payload["lighthouseResult"]["categories"]["performance"]["score"]
        .as_f64()
        .ok_or_else(|| UpstreamError::transient(SERVICE, "payload missing performance score"))?;
    let vitals = CoreVitals {
        lcp_ms: audit_ms(&payload, "largest-contentful-paint"),
        fcp_ms: audit_ms(&payload, "first-contentful-paint"),
        tbt_ms: audit_ms(&payload, "total-blocking-time"),
        cls: audit_ms(&payload, "cumulative-layout-shift"),
        ttfb_ms: audit_ms(&payload, "server-response-time"),
    };
    let total_bytes = audit_ms(&payload, "total-byte-weight") as u64;
    Ok(MeasurementOutcome {
        url: url.to_string(),
        performance: score * 100.0,
        vitals,
        total_bytes,
        raw: payload,
    })
}

#[async_trait]
impl MeasurementApi for PageSpeedClient {
    async fn measure(
        &self,
        url: &str,
        strategy: MeasureStrategy,
    ) -> AdapterResult<MeasurementOutcome> {
        let response = self
            .client
            .get(format!("{}/runPagespeed", self.base_url))
            .query(&[
                ("url", url),
                ("strategy", strategy.as_str()),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|err| UpstreamError::from_http(SERVICE, err))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(SERVICE, status, &body));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|err| UpstreamError::transient(SERVICE, err.to_string()))?;
        outcome_from_payload(url, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_maps_to_outcome() {
        let payload = json!({
            "lighthouseResult": {
                "categories": {"performance": {"score": 0.87}},
                "audits": {
                    "largest-contentful-paint": {"numericValue": 1800.0},
                    "first-contentful-paint": {"numericValue": 900.0},
                    "total-blocking-time": {"numericValue": 120.0},
                    "cumulative-layout-shift": {"numericValue": 0.02},
                    "server-response-time": {"numericValue": 200.0},
                    "total-byte-weight": {"numericValue": 1_400_000.0}
                }
            }
        });
        let outcome = outcome_from_payload("https://acme.test", payload).unwrap();
        assert_eq!(outcome.performance, 87.0);
        assert_eq!(outcome.vitals.lcp_ms, 1800.0);
        assert_eq!(outcome.total_bytes, 1_400_000);
    }

    #[test]
    fn missing_score_is_retryable() {
        let err = outcome_from_payload("https://acme.test", json!({})).unwrap_err();
        assert!(err.retryable);
    }
}
